// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Background maintenance: seal elapsed buckets, expire old partitions
//! and repair index drift on a fixed interval.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use ragvec_core::Timestamp;
use tracing::{debug, info, warn};

use crate::partition::PartitionManager;

pub struct Reconciler {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reconciler {
    pub fn spawn(
        manager: Arc<PartitionManager>,
        interval: Duration,
        auto_seal: bool,
    ) -> std::io::Result<Self> {
        let (shutdown, inbox) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("ragvec-reconciler".to_string())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "Reconciler started");
                loop {
                    match inbox.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => run_once(&manager, auto_seal),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Reconciler stopped");
            })?;
        Ok(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for an in-progress pass to finish
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Reconciler thread panicked");
            }
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One maintenance pass
pub fn run_once(manager: &PartitionManager, auto_seal: bool) {
    let now = Timestamp::now();
    if auto_seal {
        match manager.seal_elapsed(now) {
            Ok(sealed) if !sealed.is_empty() => info!(count = sealed.len(), "Sealed elapsed partitions"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Sealing pass failed"),
        }
    }
    match manager.expire(now) {
        Ok(expired) if !expired.is_empty() => info!(count = expired.len(), "Expired partitions"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Retention pass failed"),
    }
    match manager.reconcile() {
        Ok(report) => debug!(
            checked = report.partitions_checked,
            repaired = report.records_repaired,
            rebuilt = report.partitions_rebuilt,
            inconsistent = report.inconsistent.len(),
            "Reconcile pass complete"
        ),
        Err(e) => warn!(error = %e, "Reconcile pass failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionLayout;
    use crate::partition::PartitionSettings;
    use ragvec_core::SourceType;
    use ragvec_index::VamanaConfig;
    use ragvec_storage::{StoreConfig, VectorRecordStore};
    use tempfile::tempdir;

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            VectorRecordStore::open(StoreConfig::default().with_data_dir(dir.path())).unwrap(),
        );
        let settings = PartitionSettings {
            bucket_width_ms: 1000,
            layout: PartitionLayout::PerSource,
            retention_ms: None,
            index: VamanaConfig::for_dimension(2),
            data_dir: dir.path().to_path_buf(),
        };
        let manager = Arc::new(PartitionManager::open(settings, store).unwrap());

        let mut reconciler =
            Reconciler::spawn(manager, Duration::from_secs(3600), true).unwrap();
        let started = std::time::Instant::now();
        reconciler.stop();
        reconciler.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_run_once_seals_past_buckets() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            VectorRecordStore::open(StoreConfig::default().with_data_dir(dir.path())).unwrap(),
        );
        let settings = PartitionSettings {
            bucket_width_ms: 1000,
            layout: PartitionLayout::PerSource,
            retention_ms: None,
            index: VamanaConfig::for_dimension(2),
            data_dir: dir.path().to_path_buf(),
        };
        let manager = PartitionManager::open(settings, store).unwrap();
        let old = manager
            .partition_for(SourceType::Faq, Timestamp::from_millis(0))
            .unwrap();

        run_once(&manager, true);
        assert!(old.is_sealed());
    }
}
