#![allow(dead_code)]

use once_cell::sync::Lazy;
use ssh_exec_proxy::services::dispatcher::{Clock, Dispatcher, DispatcherMessage};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

pub static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub fn tmp_path(prefix: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

#[derive(Default)]
pub struct RecordingDispatcher {
    pub told: StdMutex<Vec<DispatcherMessage>>,
}

impl RecordingDispatcher {
    pub fn messages(&self) -> Vec<DispatcherMessage> {
        self.told.lock().unwrap().clone()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn tell(&self, message: DispatcherMessage) {
        self.told.lock().unwrap().push(message);
    }
}

#[derive(Default)]
pub struct RecordingClock {
    pub pings: StdMutex<Vec<(Duration, DispatcherMessage)>>,
}

impl RecordingClock {
    pub fn pings(&self) -> Vec<(Duration, DispatcherMessage)> {
        self.pings.lock().unwrap().clone()
    }
}

impl Clock for RecordingClock {
    fn ping(&self, _target: Arc<dyn Dispatcher>, delay: Duration, message: DispatcherMessage) {
        self.pings.lock().unwrap().push((delay, message));
    }
}
