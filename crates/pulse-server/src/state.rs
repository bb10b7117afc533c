//! Shared handles injected into every HTTP handler and background task.

use crate::bus::ConfigBus;
use crate::hub::StateHub;
use chrono::{DateTime, Utc};
use pulse_alert::dispatch::Dispatcher;
use pulse_alert::engine::AlertEngine;
use pulse_common::types::NodeConfig;
use pulse_store::{HistoryRing, NodeStore};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<StateHub>,
    pub history: Arc<Mutex<HistoryRing>>,
    pub engine: Arc<Mutex<AlertEngine>>,
    pub dispatcher: Dispatcher,
    pub node_store: Arc<NodeStore>,
    /// Live node list, kept in sync with the encrypted store; the bus
    /// carries mutations to the poll supervisor.
    pub nodes: Arc<RwLock<Vec<NodeConfig>>>,
    pub bus: ConfigBus,
    pub settings: Arc<pulse_store::system::SystemSettings>,
    pub data_dir: PathBuf,
    pub start_time: DateTime<Utc>,
}
