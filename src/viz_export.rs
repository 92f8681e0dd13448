// src/viz_export.rs
use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::render::{ChartSpec, ChartTarget};

/* -------------------------------------------------------------------------- */
/* Sink contract                                                              */
/* -------------------------------------------------------------------------- */

/// Token for the chart currently drawn into a target.
///
/// Deliberately not `Clone`: releasing consumes it, so a handle can be
/// released at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct ChartHandle {
    pub target: ChartTarget,
    pub id: String,
    pub revision: u64,
}

/// Freshness banner shown next to the charts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewStatus {
    pub stale: bool,
    pub reason: Option<String>,
    pub refreshed_at: Option<String>, // RFC 3339, last successful refresh
    pub records_in_view: usize,
    pub filters: String,
}

/// Where charts end up. A target must be released before it is drawn again.
pub trait RenderSink: Send {
    fn draw(&mut self, spec: &ChartSpec) -> Result<ChartHandle>;

    fn release(&mut self, handle: ChartHandle) -> Result<()>;

    fn status(&mut self, status: &ViewStatus) -> Result<()>;
}

fn handle_id(target: ChartTarget, revision: u64) -> String {
    format!("{:016x}", xxh3_64(format!("{}|{}", target.slug(), revision).as_bytes()))
}

/* -------------------------------------------------------------------------- */
/* JSON files                                                                 */
/* -------------------------------------------------------------------------- */

/// Writes each chart as `viz.<target>.json` plus `viz.status.json` and a
/// `viz.index.json` listing the live charts.
pub struct JsonFileSink {
    dir: PathBuf,
    live: BTreeMap<ChartTarget, String>,
    revision: u64,
}

impl JsonFileSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("create {:?}", dir))?;
        Ok(Self {
            dir,
            live: BTreeMap::new(),
            revision: 0,
        })
    }

    pub fn chart_path(&self, target: ChartTarget) -> PathBuf {
        self.dir.join(format!("viz.{}.json", target.slug()))
    }

    fn write_index(&self) -> Result<()> {
        let files: Vec<String> = self
            .live
            .keys()
            .map(|t| format!("viz.{}.json", t.slug()))
            .collect();
        let idx = json!({
            "version": 1,
            "revision": self.revision,
            "charts": self.live,
            "files": files,
        });
        write_json(self.dir.join("viz.index.json"), &idx)
    }
}

impl RenderSink for JsonFileSink {
    fn draw(&mut self, spec: &ChartSpec) -> Result<ChartHandle> {
        if let Some(existing) = self.live.get(&spec.target) {
            bail!(
                "target {} still holds chart {}; release it first",
                spec.target.slug(),
                existing
            );
        }
        self.revision += 1;
        let id = handle_id(spec.target, self.revision);
        let doc = json!({
            "handle": id,
            "revision": self.revision,
            "target": spec.target,
            "type": spec.kind,
            "data": { "labels": spec.labels, "datasets": spec.series },
            "options": spec.options,
        });
        let path = self.chart_path(spec.target);
        if let Err(e) = write_json(&path, &doc) {
            remove_if_present(&path);
            return Err(e).with_context(|| format!("write {:?}", path));
        }
        self.live.insert(spec.target, id.clone());
        if let Err(e) = self.write_index() {
            // the caller never gets a handle, so the target must stay free
            self.live.remove(&spec.target);
            remove_if_present(&path);
            return Err(e).context("write viz.index.json");
        }
        debug!("Chart drawn - target={}, handle={}", spec.target.slug(), id);

        Ok(ChartHandle {
            target: spec.target,
            id,
            revision: self.revision,
        })
    }

    fn release(&mut self, handle: ChartHandle) -> Result<()> {
        match self.live.get(&handle.target) {
            Some(id) if *id == handle.id => {}
            _ => bail!(
                "handle {} does not own target {}",
                handle.id,
                handle.target.slug()
            ),
        }
        // the handle is consumed either way, so the target is freed before any I/O
        self.live.remove(&handle.target);
        let path = self.chart_path(handle.target);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e).with_context(|| format!("remove {:?}", path));
            }
        }
        self.write_index()?;
        debug!("Chart released - target={}, handle={}", handle.target.slug(), handle.id);
        Ok(())
    }

    fn status(&mut self, status: &ViewStatus) -> Result<()> {
        write_json(self.dir.join("viz.status.json"), status)
    }
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove chart file - path={}, error={}", path.display(), e);
        }
    }
}

fn write_json<P: AsRef<Path>, T: ?Sized + Serialize>(path: P, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?)
        .map(|_| ())
        .map_err(|e| e.into())
}

/* -------------------------------------------------------------------------- */
/* In memory                                                                  */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Default)]
pub struct MemorySinkState {
    pub live: BTreeMap<ChartTarget, ChartSpec>,
    pub draws: usize,
    pub releases: usize,
    pub statuses: Vec<ViewStatus>,
    revision: u64,
    owners: BTreeMap<ChartTarget, String>,
}

/// Headless sink keeping the latest chart per target. Clones share state, so
/// a test can keep one clone for inspection.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inspect<R>(&self, f: impl FnOnce(&MemorySinkState) -> R) -> R {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&guard)
    }
}

impl RenderSink for MemorySink {
    fn draw(&mut self, spec: &ChartSpec) -> Result<ChartHandle> {
        let mut s = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if s.owners.contains_key(&spec.target) {
            bail!("target {} drawn twice without release", spec.target.slug());
        }
        s.revision += 1;
        let revision = s.revision;
        let id = handle_id(spec.target, revision);
        s.owners.insert(spec.target, id.clone());
        s.live.insert(spec.target, spec.clone());
        s.draws += 1;
        Ok(ChartHandle {
            target: spec.target,
            id,
            revision,
        })
    }

    fn release(&mut self, handle: ChartHandle) -> Result<()> {
        let mut s = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if s.owners.get(&handle.target) != Some(&handle.id) {
            bail!("handle {} does not own target {}", handle.id, handle.target.slug());
        }
        s.owners.remove(&handle.target);
        s.live.remove(&handle.target);
        s.releases += 1;
        Ok(())
    }

    fn status(&mut self, status: &ViewStatus) -> Result<()> {
        let mut s = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        s.statuses.push(status.clone());
        Ok(())
    }
}
