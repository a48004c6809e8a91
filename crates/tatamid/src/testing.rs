//! Scripted detector and frame source for engine and session tests.

use crate::engine::{DetectorLoader, SourceOpener};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tatami_core::{DetectedFace, Descriptor, Detector, DetectorError, FaceBox};
use tatami_hw::{CameraError, Frame, FrameSource};

const FRAME_SIZE: u32 = 8;

#[derive(Clone)]
pub struct FakeDetector {
    dimension: usize,
    faces: Arc<Mutex<Vec<DetectedFace>>>,
    calls: Arc<AtomicUsize>,
    slow_calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl FakeDetector {
    /// Reports one face with every descriptor value at 0.5.
    pub fn new(dimension: usize) -> Self {
        let detector = Self {
            dimension,
            faces: Arc::default(),
            calls: Arc::default(),
            slow_calls: Arc::default(),
            delay: Duration::ZERO,
        };
        detector.set_faces(&[vec![0.5; dimension]]);
        detector
    }

    /// The next `calls` detections each take `delay`.
    pub fn slow(mut self, calls: usize, delay: Duration) -> Self {
        self.slow_calls.store(calls, Ordering::SeqCst);
        self.delay = delay;
        self
    }

    pub fn set_faces(&self, descriptors: &[Vec<f32>]) {
        let faces = descriptors
            .iter()
            .enumerate()
            .map(|(i, values)| DetectedFace {
                bbox: FaceBox {
                    x: 0.1 + 0.4 * i as f32,
                    y: 0.25,
                    width: 0.3,
                    height: 0.5,
                },
                descriptor: Descriptor::new(values.clone()).unwrap(),
            })
            .collect();
        *self.faces.lock() = faces;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for FakeDetector {
    fn detect(&mut self, _frame: &[u8], _w: u32, _h: u32) -> Result<Vec<DetectedFace>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let slow = self
            .slow_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if slow {
            std::thread::sleep(self.delay);
        }
        Ok(self.faces.lock().clone())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Clone)]
pub struct FakeSource {
    value: u8,
    opens: Arc<AtomicUsize>,
    captures: Arc<AtomicUsize>,
    held: Arc<AtomicUsize>,
}

impl FakeSource {
    pub fn bright() -> Self {
        Self::filled(200)
    }

    pub fn dark() -> Self {
        Self::filled(0)
    }

    fn filled(value: u8) -> Self {
        Self {
            value,
            opens: Arc::default(),
            captures: Arc::default(),
            held: Arc::default(),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// Opened sources the engine has not dropped yet.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }
}

impl FrameSource for FakeSource {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        let seq = self.captures.fetch_add(1, Ordering::SeqCst) as u32;
        let data = vec![self.value; (FRAME_SIZE * FRAME_SIZE) as usize];
        Ok(Frame::new(data, FRAME_SIZE, FRAME_SIZE, seq)?)
    }

    fn describe(&self) -> String {
        "fake".into()
    }
}

pub fn detector_loader(detector: FakeDetector) -> DetectorLoader {
    Box::new(move || Ok(Box::new(detector) as Box<dyn Detector + Send>))
}

/// The source as handed to the engine; dropping it counts as a release.
struct OpenedSource(FakeSource);

impl FrameSource for OpenedSource {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        self.0.capture()
    }

    fn describe(&self) -> String {
        self.0.describe()
    }
}

impl Drop for OpenedSource {
    fn drop(&mut self) {
        self.0.held.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn source_opener(source: FakeSource) -> SourceOpener {
    Box::new(move || {
        source.opens.fetch_add(1, Ordering::SeqCst);
        source.held.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(OpenedSource(source.clone())) as Box<dyn FrameSource + Send>)
    })
}
