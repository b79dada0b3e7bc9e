//! Blob storage for per-supervoxel data, served per aggregated label as a
//! tar archive.
//!
//! Blobs are keyed by supervoxel id plus the instance's configured file
//! extension. `get_tar` expands a label to its supervoxel set through the
//! synced mapping instance, fans the reads out over a worker pool, and a
//! single writer streams the results as a tar; file order is unspecified,
//! but each header always precedes its own data.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::badreq;
use crate::config::Config;
use crate::encoding::keycode::blob_tkey;
use crate::encoding::InstanceId;
use crate::error::{Error, Result};
use crate::store::{KvStore, VersionedCtx};
use crate::svmap::SvMap;
use crate::version::{AncestryProvider, VersionId};

/// Response MIME for tar archives.
pub const TAR_MIME: &str = "application/tar";

/// Response MIME for individual blobs.
pub const OCTET_STREAM_MIME: &str = "application/octet-stream";

const HELP_TEXT: &str = "\
tarsupervoxels: data blobs associated with supervoxels

  GET  /node/<uuid>/<name>/help
  GET  /node/<uuid>/<name>/info
  POST /node/<uuid>/<name>/info
  POST /node/<uuid>/<name>/sync?replace=<bool>
  GET  /node/<uuid>/<name>/supervoxel/<id>
  POST /node/<uuid>/<name>/supervoxel/<id>
  DEL  /node/<uuid>/<name>/supervoxel/<id>
  GET  /node/<uuid>/<name>/tarfile/<label>
  POST /node/<uuid>/<name>/load

Tar file names have the form <supervoxel>.<extension>, where the extension
is fixed per instance. The tarfile endpoint requires a sync to a
label-mapping instance and streams every blob currently mapped to the
requested label.
";

struct SyncedMapping {
    name: String,
    svmap: Arc<SvMap>,
}

enum FetchResult {
    File {
        name: String,
        mtime: SystemTime,
        data: Vec<u8>,
    },
    // Missing supervoxels are dropped from the tar, not errors.
    Missing,
    Failed(Error),
}

/// Per-supervoxel blob store for one instance.
pub struct TarSupervoxels {
    store: KvStore,
    instance: InstanceId,
    dag: Arc<dyn AncestryProvider>,
    name: String,
    extension: String,
    fetchers: usize,
    syncs: RwLock<Vec<SyncedMapping>>,
}

impl TarSupervoxels {
    pub fn new(
        store: KvStore,
        instance: InstanceId,
        dag: Arc<dyn AncestryProvider>,
        name: impl Into<String>,
        extension: impl Into<String>,
        config: &Config,
    ) -> Result<Self> {
        let extension = extension.into();
        if extension.is_empty() {
            return Err(Error::BadRequest(
                "tarsupervoxels instances must have Extension set in the configuration".into(),
            ));
        }
        Ok(Self {
            store,
            instance,
            dag,
            name: name.into(),
            extension,
            fetchers: config.tar_fetchers.max(1),
            syncs: RwLock::new(Vec::new()),
        })
    }

    pub fn help(&self) -> &'static str {
        HELP_TEXT
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Instance properties as `{Base, Extended: {Extension}}` JSON.
    pub fn info_json(&self) -> Result<String> {
        let info = serde_json::json!({
            "Base": {
                "Name": self.name,
                "TypeName": "tarsupervoxels",
            },
            "Extended": {
                "Extension": self.extension,
            },
        });
        Ok(info.to_string())
    }

    /// Binds (or with None, clears) the synced label-mapping instance.
    pub fn set_sync(&self, binding: Option<(String, Arc<SvMap>)>) {
        let mut syncs = self.syncs.write().unwrap();
        syncs.clear();
        if let Some((name, svmap)) = binding {
            syncs.push(SyncedMapping { name, svmap });
        }
    }

    /// Applies a `{"sync": "<comma-sep names>"}` body. With `replace` the
    /// named set substitutes the current one (an empty list clears it);
    /// otherwise names append.
    pub fn sync_by_json<F>(&self, body: &[u8], replace: bool, resolve: F) -> Result<()>
    where
        F: Fn(&str) -> Result<Arc<SvMap>>,
    {
        #[derive(Deserialize)]
        struct SyncSpec {
            sync: String,
        }
        let spec: SyncSpec = serde_json::from_slice(body)?;
        let mut new_syncs = Vec::new();
        for name in spec.sync.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            new_syncs.push(SyncedMapping {
                svmap: resolve(name)?,
                name: name.to_string(),
            });
        }
        let mut syncs = self.syncs.write().unwrap();
        if replace {
            *syncs = new_syncs;
        } else {
            syncs.extend(new_syncs);
        }
        Ok(())
    }

    pub fn sync_names(&self) -> Vec<String> {
        self.syncs.read().unwrap().iter().map(|s| s.name.clone()).collect()
    }

    /// Blob for one supervoxel.
    pub fn get(&self, v: VersionId, supervoxel: u64) -> Result<Vec<u8>> {
        self.check_supervoxel(supervoxel)?;
        let ctx = self.ctx(v)?;
        ctx.get(&blob_tkey(supervoxel, &self.extension))?
            .ok_or(Error::NotFound)
    }

    pub fn put(&self, v: VersionId, supervoxel: u64, data: Vec<u8>) -> Result<()> {
        self.check_supervoxel(supervoxel)?;
        let ctx = self.ctx(v)?;
        ctx.put(&blob_tkey(supervoxel, &self.extension), data)
    }

    pub fn delete(&self, v: VersionId, supervoxel: u64) -> Result<()> {
        self.check_supervoxel(supervoxel)?;
        let ctx = self.ctx(v)?;
        ctx.delete(&blob_tkey(supervoxel, &self.extension))
    }

    /// Streams a tar of every blob mapped to `label` at the version.
    ///
    /// Reads fan out over the fetcher pool; the writer consumes exactly one
    /// result per supervoxel. The first worker error cancels outstanding
    /// work through the done flag and aborts the stream.
    pub async fn get_tar<W: Write>(&self, v: VersionId, label: u64, out: W) -> Result<()> {
        if label == 0 {
            return Err(Error::BadRequest(
                "label 0 is protected background value and cannot be used".into(),
            ));
        }
        let svmap = self.synced_mapping().ok_or(Error::NoSync)?;
        let supervoxels: Vec<u64> = svmap.get_supervoxels(v, label)?.into_iter().collect();
        if supervoxels.is_empty() {
            return Err(Error::NotFound);
        }
        debug!(label, count = supervoxels.len(), "assembling supervoxel tar");

        let num_fetchers = self.fetchers.min(supervoxels.len());
        let mut partitions: Vec<Vec<u64>> = vec![Vec::new(); num_fetchers];
        for (i, supervoxel) in supervoxels.iter().enumerate() {
            partitions[i % num_fetchers].push(*supervoxel);
        }

        let (tx, mut rx) = mpsc::channel(supervoxels.len());
        let done = Arc::new(AtomicBool::new(false));
        for partition in partitions.into_iter().filter(|p| !p.is_empty()) {
            let tx = tx.clone();
            let done = Arc::clone(&done);
            let store = Arc::clone(&self.store);
            let dag = Arc::clone(&self.dag);
            let instance = self.instance;
            let extension = self.extension.clone();
            tokio::spawn(async move {
                let ctx = match VersionedCtx::new(store, instance, v, dag.as_ref()) {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        let _ = tx.send(FetchResult::Failed(e)).await;
                        return;
                    }
                };
                for supervoxel in partition {
                    if done.load(Ordering::Acquire) {
                        return;
                    }
                    let result = fetch_blob(&ctx, supervoxel, &extension);
                    if tx.send(result).await.is_err() {
                        return;
                    }
                }
            });
        }
        drop(tx);

        let mut builder = tar::Builder::new(out);
        for _ in 0..supervoxels.len() {
            let Some(result) = rx.recv().await else {
                break;
            };
            match result {
                FetchResult::File { name, mtime, data } => {
                    let mut header = tar::Header::new_gnu();
                    header.set_size(data.len() as u64);
                    header.set_mode(0o755);
                    header.set_mtime(
                        mtime.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
                    );
                    builder.append_data(&mut header, name, data.as_slice())?;
                }
                FetchResult::Missing => {}
                FetchResult::Failed(e) => {
                    done.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }
        builder.finish()?;
        Ok(())
    }

    /// Bulk-load blobs from a tar stream of `<supervoxel>.<extension>`
    /// files. Any name or write failure aborts the ingest.
    pub fn ingest_tar<R: Read>(&self, v: VersionId, reader: R) -> Result<usize> {
        let ctx = self.ctx(v)?;
        let mut archive = tar::Archive::new(reader);
        let mut count = 0usize;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let (supervoxel, ext) = parse_blob_name(&name, count + 1)?;
            if ext != self.extension {
                return Err(Error::BadRequest(format!(
                    "file {} name has bad extension (expect {:?}): {name}",
                    count + 1,
                    self.extension
                )));
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            ctx.put(&blob_tkey(supervoxel, &ext), data)?;
            count += 1;
        }
        debug!(count, "ingested supervoxel tar");
        Ok(count)
    }

    fn ctx(&self, v: VersionId) -> Result<VersionedCtx> {
        VersionedCtx::new(Arc::clone(&self.store), self.instance, v, self.dag.as_ref())
    }

    fn synced_mapping(&self) -> Option<Arc<SvMap>> {
        self.syncs.read().unwrap().first().map(|s| Arc::clone(&s.svmap))
    }

    fn check_supervoxel(&self, supervoxel: u64) -> Result<()> {
        if supervoxel == 0 {
            return Err(Error::BadRequest(
                "supervoxel 0 is reserved and cannot have data saved under 0 id".into(),
            ));
        }
        Ok(())
    }
}

fn fetch_blob(ctx: &VersionedCtx, supervoxel: u64, extension: &str) -> FetchResult {
    match ctx.get_with_timestamp(&blob_tkey(supervoxel, extension)) {
        Ok(Some((data, mtime))) => FetchResult::File {
            name: format!("{supervoxel}.{extension}"),
            mtime,
            data,
        },
        Ok(None) => FetchResult::Missing,
        Err(e) => FetchResult::Failed(e),
    }
}

fn parse_blob_name(name: &str, filenum: usize) -> Result<(u64, String)> {
    let Some((id, ext)) = name.split_once('.') else {
        return Err(badreq!(
            "file {filenum} name is invalid, expect supervoxel+ext: {name}"
        ));
    };
    let supervoxel: u64 = id
        .parse()
        .map_err(|_| badreq!("file {filenum} name is invalid, expect supervoxel+ext: {name}"))?;
    if supervoxel == 0 {
        return Err(Error::BadRequest(
            "supervoxel 0 is reserved and cannot have data saved under 0 id".into(),
        ));
    }
    if ext.is_empty() {
        return Err(badreq!("file {filenum} name is missing an extension: {name}"));
    }
    Ok((supervoxel, ext.to_string()))
}
