pub trait CaptureDevice {
    fn stop(&mut self);
}

// Scoped guard around an exclusive capture device. `stop` runs exactly once
// whether the session ends by `release`, by drop, or by panic unwind.
#[derive(Debug)]
pub struct CameraSession<D: CaptureDevice> {
    device: D,
    stopped: bool,
}

impl<D: CaptureDevice> CameraSession<D> {
    pub fn open(device: D) -> Self {
        Self {
            device,
            stopped: false,
        }
    }

    pub fn device(&mut self) -> &mut D {
        &mut self.device
    }

    /// Stops the device now instead of waiting for scope exit.
    pub fn release(mut self) {
        self.stop_once();
    }

    fn stop_once(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.device.stop();
        }
    }
}

impl<D: CaptureDevice> Drop for CameraSession<D> {
    fn drop(&mut self) {
        self.stop_once();
    }
}
