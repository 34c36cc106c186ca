//! Git-backed WorkStore.
//!
//! Every participant keeps its own clone of the shared repository. Reads look
//! at the working tree as of the last `sync`; `publish` turns a changeset into
//! one commit and pushes it. A push rejected because the remote moved on is
//! reported as [`StoreError::Conflict`] after the clone has been reset onto
//! the remote branch, so the caller can re-read and redo the whole operation.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::codec::{self, CLAIMS_DIR};
use crate::config::StoreSettings;
use crate::domain::{Bucket, ClaimIntent, StoreError, WorkId, WorkOrder};
use crate::ports::{BucketListing, Change, Changeset, WorkStore};

const MARKER_FILE: &str = ".courier";
const COMMITTER: [&str; 6] = [
    "-c",
    "user.name=courier",
    "-c",
    "user.email=courier@localhost",
    "-c",
    "commit.gpgsign=false",
];

pub struct GitWorkStore {
    workdir: PathBuf,
    remote_url: String,
    branch: String,
    timeout: Duration,
    /// Serialises working-tree mutations within this process.
    lock: Mutex<()>,
}

impl std::fmt::Debug for GitWorkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitWorkStore")
            .field("workdir", &self.workdir)
            .field("remote_url", &self.remote_url)
            .field("branch", &self.branch)
            .finish()
    }
}

/// Run one git command with a deadline; stdout on success.
async fn run_git(dir: &Path, args: &[&str], timeout: Duration) -> Result<String, StoreError> {
    let rendered = args.join(" ");
    tracing::debug!(dir = %dir.display(), command = %rendered, "git");

    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => {
            return Err(StoreError::Timeout {
                operation: format!("git {rendered}"),
                after: timeout,
            });
        }
        Ok(Err(e)) => {
            return Err(StoreError::Unreachable {
                detail: format!("cannot run git: {e}"),
            });
        }
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        return Err(StoreError::Git {
            command: rendered,
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn is_push_rejection(err: &StoreError) -> bool {
    match err {
        StoreError::Git { stderr, .. } => {
            stderr.contains("[rejected]")
                || stderr.contains("non-fast-forward")
                || stderr.contains("fetch first")
                || stderr.contains("Updates were rejected")
        }
        _ => false,
    }
}

impl GitWorkStore {
    /// Clone (or reuse) the working copy and check out the store branch.
    ///
    /// A remote without the branch yet gets an initial commit so that every
    /// later `sync` has an `origin/<branch>` to reset onto.
    pub async fn open(settings: &StoreSettings) -> Result<Self, StoreError> {
        let store = Self {
            workdir: settings.workdir.clone(),
            remote_url: settings.repo_url.clone(),
            branch: settings.branch.clone(),
            timeout: settings.command_timeout,
            lock: Mutex::new(()),
        };

        if !store.workdir.join(".git").exists() {
            store.clone_remote().await?;
        }

        store.git(&["fetch", "--quiet", "origin"]).await?;
        if store.remote_branch_exists().await? {
            store.checkout_remote().await?;
        } else {
            store.initialise_branch().await?;
        }

        tracing::info!(
            workdir = %store.workdir.display(),
            branch = %store.branch,
            "git work store ready"
        );
        Ok(store)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn git(&self, args: &[&str]) -> Result<String, StoreError> {
        run_git(&self.workdir, args, self.timeout).await
    }

    fn remote_ref(&self) -> String {
        format!("origin/{}", self.branch)
    }

    async fn clone_remote(&self) -> Result<(), StoreError> {
        let invalid = || {
            StoreError::io(
                &self.workdir,
                std::io::Error::new(IoErrorKind::InvalidInput, "workdir needs a directory name"),
            )
        };
        let name = self.workdir.file_name().ok_or_else(invalid)?;
        let parent = match self.workdir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| StoreError::io(&parent, e))?;

        let name = name.to_string_lossy().into_owned();
        tracing::info!(url = %self.remote_url, workdir = %self.workdir.display(), "cloning work order repository");
        run_git(
            &parent,
            &["clone", "--quiet", self.remote_url.as_str(), name.as_str()],
            self.timeout,
        )
        .await?;
        Ok(())
    }

    async fn remote_branch_exists(&self) -> Result<bool, StoreError> {
        let reference = format!("refs/remotes/{}", self.remote_ref());
        match self
            .git(&["rev-parse", "--verify", "--quiet", reference.as_str()])
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::Git { status: Some(1), .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn checkout_remote(&self) -> Result<(), StoreError> {
        let remote_ref = self.remote_ref();
        self.git(&["checkout", "--quiet", "-B", self.branch.as_str(), remote_ref.as_str()])
            .await?;
        self.git(&["clean", "-fdq"]).await?;
        Ok(())
    }

    async fn initialise_branch(&self) -> Result<(), StoreError> {
        let head = format!("refs/heads/{}", self.branch);
        self.git(&["symbolic-ref", "HEAD", head.as_str()]).await?;

        let marker = self.workdir.join(MARKER_FILE);
        tokio::fs::write(&marker, "courier work order store\n")
            .await
            .map_err(|e| StoreError::io(&marker, e))?;
        self.git(&["add", MARKER_FILE]).await?;
        self.commit("initialise work order store").await?;

        match self.push().await {
            Ok(()) => Ok(()),
            Err(e) if is_push_rejection(&e) => {
                // 他の参加者が先に初期化した
                self.git(&["fetch", "--quiet", "origin"]).await?;
                self.checkout_remote().await
            }
            Err(e) => Err(e),
        }
    }

    async fn commit(&self, message: &str) -> Result<(), StoreError> {
        let mut args: Vec<&str> = COMMITTER.to_vec();
        args.extend(["commit", "--quiet", "-m", message]);
        self.git(&args).await.map(|_| ())
    }

    async fn push(&self) -> Result<(), StoreError> {
        let refspec = format!("HEAD:refs/heads/{}", self.branch);
        self.git(&["push", "origin", refspec.as_str()]).await.map(|_| ())
    }

    /// Throw away local commits and edits; the remote wins.
    async fn discard_local(&self) {
        if let Err(e) = self.git(&["fetch", "--quiet", "origin"]).await {
            tracing::warn!(error = %e, "fetch before reset failed");
        }
        let remote_ref = self.remote_ref();
        if let Err(e) = self.git(&["reset", "--quiet", "--hard", remote_ref.as_str()]).await {
            tracing::warn!(error = %e, "reset onto remote failed");
        }
        if let Err(e) = self.git(&["clean", "-fdq"]).await {
            tracing::warn!(error = %e, "clean failed");
        }
    }

    async fn apply(&self, change: &Change) -> Result<(), StoreError> {
        match change {
            Change::Put { bucket, order } => {
                let path = self.workdir.join(codec::record_path(*bucket, &order.work_id));
                let bytes = codec::encode_order(*bucket, order)?;
                write_file(&path, &bytes).await
            }
            Change::Delete { bucket, work_id } => {
                let path = self.workdir.join(codec::record_path(*bucket, work_id));
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == IoErrorKind::NotFound => Err(StoreError::NotFound {
                        bucket: *bucket,
                        work_id: work_id.clone(),
                    }),
                    Err(e) => Err(StoreError::io(&path, e)),
                }
            }
            Change::PutIntent(intent) => {
                let path = self
                    .workdir
                    .join(codec::intent_path(&intent.work_id, &intent.worker_id));
                write_file(&path, &codec::encode_intent(intent)?).await
            }
            Change::DeleteIntent { work_id, worker_id } => {
                let path = self.workdir.join(codec::intent_path(work_id, worker_id));
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
                    Err(e) => Err(StoreError::io(&path, e)),
                }
            }
        }
    }

    async fn has_staged_changes(&self) -> Result<bool, StoreError> {
        let status = self.git(&["status", "--porcelain"]).await?;
        Ok(!status.trim().is_empty())
    }

    async fn read_intents_in(&self, dir: &Path) -> Result<Vec<ClaimIntent>, StoreError> {
        let mut intents = Vec::new();
        for path in json_files(dir).await? {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| StoreError::io(&path, e))?;
            match codec::decode_intent(&path.display().to_string(), &bytes) {
                Ok(intent) => intents.push(intent),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable claim intent"),
            }
        }
        Ok(intents)
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| StoreError::io(path, e))
}

/// Directory entries; a missing directory is simply empty.
async fn dir_entries(dir: &Path) -> Result<Vec<(PathBuf, bool)>, StoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut out = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io(dir, e))?
    {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        out.push((entry.path(), is_dir));
    }
    Ok(out)
}

async fn json_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    Ok(dir_entries(dir)
        .await?
        .into_iter()
        .filter(|(path, is_dir)| !is_dir && path.extension().is_some_and(|ext| ext == "json"))
        .map(|(path, _)| path)
        .collect())
}

#[async_trait]
impl WorkStore for GitWorkStore {
    async fn sync(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.git(&["fetch", "--quiet", "origin"]).await?;

        let remote_ref = self.remote_ref();
        if let Err(e) = self.git(&["merge", "--quiet", "--ff-only", remote_ref.as_str()]).await {
            tracing::warn!(error = %e, "fast-forward failed, resetting onto remote");
            self.git(&["reset", "--quiet", "--hard", remote_ref.as_str()]).await?;
            self.git(&["clean", "-fdq"]).await?;
        }
        Ok(())
    }

    async fn list(&self, bucket: Bucket) -> Result<BucketListing, StoreError> {
        let dir = self.workdir.join(bucket.dir_name());
        let ids = dir_entries(&dir)
            .await?
            .into_iter()
            .filter(|(_, is_dir)| !is_dir)
            .filter_map(|(path, _)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                let id = codec::work_id_from_file_name(bucket, &name);
                if id.is_none() {
                    tracing::debug!(bucket = %bucket, file = %name, "ignoring foreign file");
                }
                id
            })
            .collect();
        Ok(BucketListing::new(bucket, ids))
    }

    async fn read(&self, bucket: Bucket, work_id: &WorkId) -> Result<Option<WorkOrder>, StoreError> {
        let path = self.workdir.join(codec::record_path(bucket, work_id));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let order = codec::decode_order(bucket, work_id, &bytes)?;
        order.validate_in(bucket)?;
        Ok(Some(order))
    }

    async fn list_intents(&self, work_id: Option<&WorkId>) -> Result<Vec<ClaimIntent>, StoreError> {
        let claims = self.workdir.join(CLAIMS_DIR);
        match work_id {
            Some(id) => self.read_intents_in(&claims.join(id.as_str())).await,
            None => {
                let mut all = Vec::new();
                for (dir, is_dir) in dir_entries(&claims).await? {
                    if is_dir {
                        all.extend(self.read_intents_in(&dir).await?);
                    }
                }
                Ok(all)
            }
        }
    }

    async fn publish(&self, changeset: Changeset) -> Result<(), StoreError> {
        changeset.validate()?;
        let _guard = self.lock.lock().await;

        for change in &changeset.changes {
            if let Err(e) = self.apply(change).await {
                self.discard_local().await;
                return Err(e);
            }
        }

        let staged = async {
            self.git(&["add", "--all", "--", "."]).await?;
            self.has_staged_changes().await
        }
        .await;
        match staged {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                self.discard_local().await;
                return Err(e);
            }
        }

        if let Err(e) = self.commit(&changeset.message).await {
            self.discard_local().await;
            return Err(e);
        }

        match self.push().await {
            Ok(()) => {
                tracing::debug!(commit = %changeset.message, changes = changeset.len(), "pushed");
                Ok(())
            }
            Err(e) if is_push_rejection(&e) => {
                self.discard_local().await;
                Err(StoreError::Conflict {
                    detail: format!("push rejected for `{}`", changeset.message),
                })
            }
            Err(e) => {
                self.discard_local().await;
                Err(e)
            }
        }
    }
}
