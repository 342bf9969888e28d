//! Phased firmware flash runs with progress reporting.

use std::{future::Future, sync::Arc};

use support_tunnel_core::protocol::{FlashPhase, FlashProgress};
use support_tunnel_serial::LinkGuard;
use tokio_util::sync::CancellationToken;

use crate::{error::FlashError, flasher::Flasher, source::FirmwareSource};

/// Default bytes per flash write.
pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;

/// Receives every progress report of a run.
pub type ProgressSink = Arc<dyn Fn(FlashProgress) + Send + Sync>;

/// How a run that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOutcome {
    Complete,
    Aborted,
}

/// Emits progress reports while keeping them well ordered.
///
/// Phases only move forward, entering a phase reports 0 percent (100 for
/// `complete`), and percent within a phase never decreases. Once the run is
/// aborted or failed nothing more is reported.
pub struct ProgressTracker {
    phase: FlashPhase,
    percent: u8,
    finished: bool,
    sink: ProgressSink,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(sink: ProgressSink) -> Self {
        Self {
            phase: FlashPhase::Idle,
            percent: 0,
            finished: false,
            sink,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> FlashPhase {
        self.phase
    }

    #[must_use]
    pub const fn percent(&self) -> u8 {
        self.percent
    }

    fn emit(&self, message: impl Into<String>) {
        (self.sink)(FlashProgress {
            phase: self.phase,
            percent: self.percent,
            message: message.into(),
        });
    }

    /// Move to a later phase.
    pub fn enter(&mut self, phase: FlashPhase, message: impl Into<String>) {
        if self.finished || phase <= self.phase {
            return;
        }
        self.phase = phase;
        self.percent = if phase == FlashPhase::Complete { 100 } else { 0 };
        self.finished = !phase.is_running();
        tracing::info!(%phase, "Flash phase");
        self.emit(message);
    }

    /// Report progress within the current phase. Ignores regressions.
    pub fn advance(&mut self, percent: u8, message: impl Into<String>) {
        let percent = percent.min(100);
        if self.finished || !self.phase.is_running() || percent <= self.percent {
            return;
        }
        self.percent = percent;
        self.emit(message);
    }

    /// Report a fault in the current phase, then enter `error`.
    pub fn fail(&mut self, message: &str) {
        if self.finished {
            return;
        }
        tracing::warn!(phase = %self.phase, message, "Flash failed");
        self.emit(message);
        self.phase = FlashPhase::Error;
        self.percent = 0;
        self.finished = true;
        self.emit(message);
    }

    /// Return to idle and stop reporting.
    pub fn abort(&mut self) {
        if self.finished {
            return;
        }
        tracing::info!(phase = %self.phase, "Flash aborted");
        self.phase = FlashPhase::Idle;
        self.percent = 0;
        self.finished = true;
        self.emit("Flash aborted");
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), FlashError> {
    if cancel.is_cancelled() {
        Err(FlashError::Aborted)
    } else {
        Ok(())
    }
}

/// Run `op` unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    op: impl Future<Output = Result<T, FlashError>>,
) -> Result<T, FlashError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(FlashError::Aborted),
        result = op => result,
    }
}

fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(done.saturating_mul(100) / total).unwrap_or(100)
}

/// Runs flash jobs against a firmware source and a flasher.
#[derive(Clone)]
pub struct FlashOrchestrator {
    source: Arc<dyn FirmwareSource>,
    flasher: Arc<dyn Flasher>,
    chunk_bytes: usize,
}

impl FlashOrchestrator {
    #[must_use]
    pub fn new(source: Arc<dyn FirmwareSource>, flasher: Arc<dyn Flasher>) -> Self {
        Self {
            source,
            flasher,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }

    #[must_use]
    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }

    fn chunk_bytes(&self) -> usize {
        let align = self.flasher.write_alignment().max(1);
        (self.chunk_bytes / align).max(1) * align
    }

    /// Flash the firmware described by the manifest at `manifest_url` over
    /// `link`, which the run holds until it returns.
    ///
    /// Cancelling `cancel` interrupts whatever download or device operation
    /// is in flight and reports `idle`.
    ///
    /// # Errors
    /// Returns the fault that moved the run to `error`.
    pub async fn run(
        &self,
        manifest_url: &str,
        link: &mut LinkGuard,
        cancel: &CancellationToken,
        sink: ProgressSink,
    ) -> Result<FlashOutcome, FlashError> {
        let mut tracker = ProgressTracker::new(sink);
        match self.execute(manifest_url, link, cancel, &mut tracker).await {
            Ok(()) => {
                tracker.enter(FlashPhase::Complete, "Flash complete");
                Ok(FlashOutcome::Complete)
            }
            Err(FlashError::Aborted) => {
                tracker.abort();
                Ok(FlashOutcome::Aborted)
            }
            Err(e) => {
                tracker.fail(&e.to_string());
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        manifest_url: &str,
        link: &mut LinkGuard,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> Result<(), FlashError> {
        tracker.enter(FlashPhase::Connecting, format!("Fetching {manifest_url}"));
        checkpoint(cancel)?;
        let manifest = cancellable(cancel, self.source.manifest(manifest_url)).await?;

        checkpoint(cancel)?;
        let chip = cancellable(cancel, self.flasher.connect(link)).await?;
        let build = manifest.build_for(&chip).ok_or_else(|| FlashError::NoBuild {
            manifest: manifest.name.clone(),
            chip: chip.clone(),
        })?;
        tracker.advance(33, format!("Connected to {chip}"));

        let mut images = Vec::with_capacity(build.parts.len());
        for (i, part) in build.parts.iter().enumerate() {
            checkpoint(cancel)?;
            let data = cancellable(cancel, self.source.part(manifest_url, &part.path)).await?;
            tracing::debug!(path = %part.path, offset = part.offset, len = data.len(), "Firmware part ready");
            images.push((part.offset, data));
            tracker.advance(
                33 + percent_of(i + 1, build.parts.len()) * 2 / 3,
                format!("Downloaded {}", part.path),
            );
        }

        tracker.enter(FlashPhase::Erasing, "Erasing flash");
        for (i, (offset, data)) in images.iter().enumerate() {
            checkpoint(cancel)?;
            cancellable(cancel, self.flasher.erase(link, *offset, data.len())).await?;
            tracker.advance(percent_of(i + 1, images.len()), format!("Erased 0x{offset:x}"));
        }

        let total: usize = images.iter().map(|(_, data)| data.len()).sum();
        let chunk_bytes = self.chunk_bytes();
        tracker.enter(FlashPhase::Flashing, format!("Writing {total} bytes"));
        let mut written = 0;
        for (offset, data) in &images {
            let mut address = *offset;
            for chunk in data.chunks(chunk_bytes) {
                checkpoint(cancel)?;
                cancellable(cancel, self.flasher.write(link, address, chunk)).await?;
                written += chunk.len();
                address = u32::try_from(chunk.len())
                    .ok()
                    .and_then(|len| address.checked_add(len))
                    .ok_or_else(|| FlashError::Device(format!("image exceeds address space at 0x{address:x}")))?;
                tracker.advance(percent_of(written, total), format!("Wrote {written} of {total} bytes"));
            }
        }

        tracker.enter(FlashPhase::Verifying, "Verifying");
        for (i, (offset, data)) in images.iter().enumerate() {
            checkpoint(cancel)?;
            cancellable(cancel, self.flasher.verify(link, *offset, data)).await?;
            tracker.advance(percent_of(i + 1, images.len()), format!("Verified 0x{offset:x}"));
        }

        tracker.enter(FlashPhase::Resetting, "Resetting device");
        checkpoint(cancel)?;
        cancellable(cancel, self.flasher.reset(link)).await
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use support_tunnel_serial::LoopbackDevice;

    use super::*;
    use crate::{
        flasher::MemoryFlasher,
        manifest::{Build, Manifest, Part},
        source::MemoryFirmwareSource,
    };

    const URL: &str = "mem://fw/manifest.json";

    fn source() -> Arc<MemoryFirmwareSource> {
        let manifest = Manifest {
            name: "node".into(),
            version: Some("1.0.0".into()),
            builds: vec![Build {
                chip_family: "ESP32".into(),
                parts: vec![
                    Part {
                        path: "boot.bin".into(),
                        offset: 0x1000,
                    },
                    Part {
                        path: "app.bin".into(),
                        offset: 0x10000,
                    },
                ],
            }],
        };
        Arc::new(
            MemoryFirmwareSource::new()
                .with_manifest(URL, manifest)
                .with_part("boot.bin", vec![0xAA; 100])
                .with_part("app.bin", vec![0x55; 1000]),
        )
    }

    async fn link() -> LinkGuard {
        LinkGuard::acquire(Arc::new(LoopbackDevice::new()), 115_200)
            .await
            .unwrap()
    }

    fn recorder() -> (ProgressSink, Arc<Mutex<Vec<FlashProgress>>>) {
        let log = Arc::new(Mutex::new(Vec::<FlashProgress>::new()));
        let sink_log = Arc::clone(&log);
        let sink: ProgressSink = Arc::new(move |p: FlashProgress| sink_log.lock().unwrap().push(p));
        (sink, log)
    }

    fn assert_well_ordered(reports: &[FlashProgress]) {
        for pair in reports.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if b.phase == FlashPhase::Error || b.phase == FlashPhase::Idle {
                continue;
            }
            assert!(b.phase >= a.phase, "{:?} after {:?}", b.phase, a.phase);
            if a.phase == b.phase {
                assert!(b.percent >= a.percent, "percent regressed in {}", a.phase);
            }
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let flasher = MemoryFlasher::new("esp32");
        let orchestrator =
            FlashOrchestrator::new(source(), Arc::new(flasher.clone())).with_chunk_bytes(256);
        let (sink, log) = recorder();

        let outcome = orchestrator.run(URL, &mut link().await, &CancellationToken::new(), sink).await.unwrap();
        assert_eq!(outcome, FlashOutcome::Complete);

        let reports = log.lock().unwrap().clone();
        assert_well_ordered(&reports);
        let entered: Vec<FlashPhase> = reports
            .iter()
            .filter(|p| p.percent == 0 || p.phase == FlashPhase::Complete)
            .map(|p| p.phase)
            .collect();
        assert_eq!(
            entered,
            vec![
                FlashPhase::Connecting,
                FlashPhase::Erasing,
                FlashPhase::Flashing,
                FlashPhase::Verifying,
                FlashPhase::Resetting,
                FlashPhase::Complete,
            ]
        );
        assert_eq!(reports.last().unwrap().percent, 100);

        // 100 bytes in one chunk, 1000 bytes in four
        assert_eq!(flasher.writes(), 5);
        assert_eq!(flasher.read(0x10000, 1000), vec![0x55; 1000]);
        assert_eq!(flasher.resets(), 1);
    }

    #[tokio::test]
    async fn test_abort_during_flashing() {
        let flasher = MemoryFlasher::new("ESP32");
        let orchestrator =
            FlashOrchestrator::new(source(), Arc::new(flasher.clone())).with_chunk_bytes(100);
        let cancel = CancellationToken::new();
        let log = Arc::new(Mutex::new(Vec::<FlashProgress>::new()));

        let sink_log = Arc::clone(&log);
        let sink_cancel = cancel.clone();
        let sink: ProgressSink = Arc::new(move |p: FlashProgress| {
            if p.phase == FlashPhase::Flashing && p.percent > 0 {
                sink_cancel.cancel();
            }
            sink_log.lock().unwrap().push(p);
        });

        let outcome = orchestrator.run(URL, &mut link().await, &cancel, sink).await.unwrap();
        assert_eq!(outcome, FlashOutcome::Aborted);

        let reports = log.lock().unwrap().clone();
        let first_progress = reports
            .iter()
            .position(|p| p.phase == FlashPhase::Flashing && p.percent > 0)
            .unwrap();
        let after = &reports[first_progress + 1..];
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].phase, FlashPhase::Idle);
        assert_eq!(after[0].percent, 0);
        assert_eq!(flasher.writes(), 1);
        assert_eq!(flasher.resets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_from_another_task() {
        let flasher = MemoryFlasher::new("ESP32").with_write_delay(Duration::from_millis(50));
        let orchestrator = FlashOrchestrator::new(source(), Arc::new(flasher.clone())).with_chunk_bytes(10);
        let cancel = CancellationToken::new();
        let (sink, log) = recorder();

        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { orchestrator.run(URL, &mut link().await, &cancel, sink).await })
        };
        tokio::time::sleep(Duration::from_millis(175)).await;
        cancel.cancel();

        assert_eq!(run.await.unwrap().unwrap(), FlashOutcome::Aborted);
        let reports = log.lock().unwrap().clone();
        assert_eq!(reports.last().unwrap().phase, FlashPhase::Idle);
        assert!(flasher.writes() < 110);
    }

    #[tokio::test]
    async fn test_failure_reports_phase_then_error() {
        let flasher = MemoryFlasher::new("ESP32");
        flasher.fail_in(FlashPhase::Verifying);
        let orchestrator = FlashOrchestrator::new(source(), Arc::new(flasher.clone()));
        let (sink, log) = recorder();

        let err = orchestrator.run(URL, &mut link().await, &CancellationToken::new(), sink).await.unwrap_err();
        assert!(matches!(err, FlashError::Device(_)));

        let reports = log.lock().unwrap().clone();
        assert_well_ordered(&reports);
        let n = reports.len();
        assert_eq!(reports[n - 2].phase, FlashPhase::Verifying);
        assert!(reports[n - 2].message.contains("simulated fault"));
        assert_eq!(reports[n - 1].phase, FlashPhase::Error);
        assert_eq!(flasher.resets(), 0);
    }

    #[tokio::test]
    async fn test_unknown_chip_fails_while_connecting() {
        let orchestrator = FlashOrchestrator::new(source(), Arc::new(MemoryFlasher::new("ESP32-C3")));
        let (sink, log) = recorder();

        let err = orchestrator.run(URL, &mut link().await, &CancellationToken::new(), sink).await.unwrap_err();
        assert!(matches!(err, FlashError::NoBuild { .. }));

        let phases: Vec<FlashPhase> = log.lock().unwrap().iter().map(|p| p.phase).collect();
        assert_eq!(
            phases,
            vec![FlashPhase::Connecting, FlashPhase::Connecting, FlashPhase::Error]
        );
    }

    /// Serves the manifest, then stalls on every part download.
    struct StalledSource(Arc<MemoryFirmwareSource>);

    #[async_trait]
    impl FirmwareSource for StalledSource {
        async fn manifest(&self, url: &str) -> Result<Manifest, FlashError> {
            self.0.manifest(url).await
        }

        async fn part(&self, _manifest_url: &str, _path: &str) -> Result<Vec<u8>, FlashError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(FlashError::Part {
                path: "stalled".into(),
                reason: "gave up".into(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_interrupts_a_stalled_download() {
        let flasher = MemoryFlasher::new("ESP32");
        let orchestrator =
            FlashOrchestrator::new(Arc::new(StalledSource(source())), Arc::new(flasher.clone()));
        let cancel = CancellationToken::new();
        let (sink, log) = recorder();

        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { orchestrator.run(URL, &mut link().await, &cancel, sink).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("abort waited for the download")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, FlashOutcome::Aborted);
        assert_eq!(log.lock().unwrap().last().unwrap().phase, FlashPhase::Idle);
        assert_eq!(flasher.writes(), 0);
    }

    #[tokio::test]
    async fn test_chunks_follow_flasher_alignment() {
        struct Aligned(MemoryFlasher);

        #[async_trait]
        impl Flasher for Aligned {
            async fn connect(&self, link: &mut LinkGuard) -> Result<String, FlashError> {
                self.0.connect(link).await
            }
            async fn erase(&self, link: &mut LinkGuard, offset: u32, len: usize) -> Result<(), FlashError> {
                self.0.erase(link, offset, len).await
            }
            async fn write(&self, link: &mut LinkGuard, offset: u32, data: &[u8]) -> Result<(), FlashError> {
                assert_eq!(offset % 64, 0, "unaligned write at 0x{offset:x}");
                self.0.write(link, offset, data).await
            }
            async fn verify(&self, link: &mut LinkGuard, offset: u32, data: &[u8]) -> Result<(), FlashError> {
                self.0.verify(link, offset, data).await
            }
            async fn reset(&self, link: &mut LinkGuard) -> Result<(), FlashError> {
                self.0.reset(link).await
            }
            fn write_alignment(&self) -> usize {
                64
            }
        }

        let flasher = MemoryFlasher::new("ESP32");
        let orchestrator = FlashOrchestrator::new(source(), Arc::new(Aligned(flasher.clone())))
            .with_chunk_bytes(100);
        let (sink, _log) = recorder();

        let outcome = orchestrator
            .run(URL, &mut link().await, &CancellationToken::new(), sink)
            .await
            .unwrap();
        assert_eq!(outcome, FlashOutcome::Complete);
        // 100 bytes in two 64-byte chunks, 1000 bytes in sixteen
        assert_eq!(flasher.writes(), 18);
        assert_eq!(flasher.read(0x10000, 1000), vec![0x55; 1000]);
    }

    #[test]
    fn test_tracker_ignores_regressions() {
        let (sink, log) = recorder();
        let mut tracker = ProgressTracker::new(sink);
        tracker.enter(FlashPhase::Erasing, "erase");
        tracker.advance(40, "a");
        tracker.advance(20, "b");
        tracker.enter(FlashPhase::Connecting, "back");
        tracker.abort();
        tracker.advance(90, "late");

        let reports = log.lock().unwrap().clone();
        let summary: Vec<(FlashPhase, u8)> = reports.iter().map(|p| (p.phase, p.percent)).collect();
        assert_eq!(
            summary,
            vec![
                (FlashPhase::Erasing, 0),
                (FlashPhase::Erasing, 40),
                (FlashPhase::Idle, 0),
            ]
        );
    }
}
