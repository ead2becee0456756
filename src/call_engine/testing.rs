//! In-memory audio devices for tests

use super::audio::{
    AudioBackend, AudioCapture, AudioError, AudioParams, AudioPlayback, CaptureEffects,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a test can observe about a device after handing it to a session
#[derive(Default)]
pub(crate) struct DeviceProbe {
    closed: AtomicBool,
    reads: AtomicUsize,
    writes: Mutex<Vec<Vec<u8>>>,
}

impl DeviceProbe {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub(crate) fn write_count(&self) -> usize {
        self.writes.lock().len()
    }
}

/// Plays back a fixed script of reads, then stays silent
pub(crate) struct ScriptedCapture {
    script: VecDeque<Result<Vec<u8>, AudioError>>,
    /// How long every read blocks, like a real device filling its buffer
    pace: Duration,
    probe: Arc<DeviceProbe>,
}

impl ScriptedCapture {
    pub(crate) fn new(
        script: Vec<Result<Vec<u8>, AudioError>>,
        pace: Duration,
    ) -> (Self, Arc<DeviceProbe>) {
        let probe = Arc::new(DeviceProbe::default());
        let capture = Self {
            script: script.into(),
            pace,
            probe: Arc::clone(&probe),
        };
        (capture, probe)
    }
}

impl AudioCapture for ScriptedCapture {
    fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        self.probe.reads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.pace);
        match self.script.pop_front() {
            Some(Ok(frame)) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            Some(Err(e)) => Err(e),
            None => Ok(0),
        }
    }

    fn request_effects(&mut self, effects: CaptureEffects) -> CaptureEffects {
        // Pretend only noise suppression exists on this device.
        CaptureEffects {
            noise_suppression: effects.noise_suppression,
            ..Default::default()
        }
    }

    fn close(&mut self) {
        self.probe.closed.store(true, Ordering::SeqCst);
    }
}

/// Records every written frame
pub(crate) struct RecordingPlayback {
    probe: Arc<DeviceProbe>,
}

impl RecordingPlayback {
    pub(crate) fn new() -> (Self, Arc<DeviceProbe>) {
        let probe = Arc::new(DeviceProbe::default());
        (
            Self {
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }
}

impl AudioPlayback for RecordingPlayback {
    fn write_frame(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        self.probe.writes.lock().push(pcm.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.probe.closed.store(true, Ordering::SeqCst);
    }
}

/// Backend handing out scripted captures and recording playbacks
pub(crate) struct MockBackend {
    script: Mutex<Vec<Vec<u8>>>,
    pace: Duration,
    fail_capture: bool,
    fail_playback: bool,
    captures: Mutex<Vec<Arc<DeviceProbe>>>,
    playbacks: Mutex<Vec<Arc<DeviceProbe>>>,
}

impl MockBackend {
    /// Every capture opened yields `frames` once, one per `pace`, then silence
    pub(crate) fn new(frames: Vec<Vec<u8>>, pace: Duration) -> Self {
        Self {
            script: Mutex::new(frames),
            pace,
            fail_capture: false,
            fail_playback: false,
            captures: Mutex::new(Vec::new()),
            playbacks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn silent() -> Self {
        Self::new(Vec::new(), Duration::from_millis(5))
    }

    pub(crate) fn without_microphone() -> Self {
        Self {
            fail_capture: true,
            ..Self::silent()
        }
    }

    pub(crate) fn without_speaker() -> Self {
        Self {
            fail_playback: true,
            ..Self::silent()
        }
    }

    pub(crate) fn captures(&self) -> Vec<Arc<DeviceProbe>> {
        self.captures.lock().clone()
    }

    pub(crate) fn playbacks(&self) -> Vec<Arc<DeviceProbe>> {
        self.playbacks.lock().clone()
    }

    pub(crate) fn last_capture(&self) -> Option<Arc<DeviceProbe>> {
        self.captures.lock().last().cloned()
    }

    pub(crate) fn last_playback(&self) -> Option<Arc<DeviceProbe>> {
        self.playbacks.lock().last().cloned()
    }
}

impl AudioBackend for MockBackend {
    fn open_capture(&self, _params: &AudioParams) -> Result<Box<dyn AudioCapture>, AudioError> {
        if self.fail_capture {
            return Err(AudioError::NoInputDevice);
        }
        let frames = self.script.lock().clone();
        let (capture, probe) = ScriptedCapture::new(frames.into_iter().map(Ok).collect(), self.pace);
        self.captures.lock().push(probe);
        Ok(Box::new(capture))
    }

    fn open_playback(&self, _params: &AudioParams) -> Result<Box<dyn AudioPlayback>, AudioError> {
        if self.fail_playback {
            return Err(AudioError::NoOutputDevice);
        }
        let (playback, probe) = RecordingPlayback::new();
        self.playbacks.lock().push(probe);
        Ok(Box::new(playback))
    }
}
