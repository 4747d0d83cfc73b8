//! Scripted stand-ins for the hardware seams, shared by the unit tests.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    io::{self, Write},
    net::Ipv4Addr,
    rc::Rc,
};

use crate::{
    clock::Clock,
    config::NetworkConfig,
    connectivity::{Radio, RadioError},
    display::Presenter,
    sampler::ClimateSensor,
    storage::{MountError, Volume},
    types::{Climate, LinkInfo},
    update::{UpdateError, UpdateListener, UpdatePoll},
};

#[derive(Debug, Clone)]
pub struct FakeClock {
    now: u32,
    yields: u32,
}

impl FakeClock {
    pub fn new(now: u32) -> Self {
        Self { now, yields: 0 }
    }

    pub fn advance(&mut self, ms: u32) {
        self.now = self.now.wrapping_add(ms);
    }

    pub fn yields(&self) -> u32 {
        self.yields
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u32 {
        self.now
    }

    fn delay_ms(&mut self, ms: u32) {
        self.advance(ms);
    }

    fn yield_now(&mut self) {
        self.yields += 1;
    }
}

#[derive(Debug, Default)]
struct RadioScript {
    join_after: Option<u32>,
    began: bool,
    polls_since_begin: u32,
    associated: bool,
    polls: u32,
    begins: u32,
    disconnects: u32,
}

/// Radio that associates on the n-th status poll after `begin`. Clones share
/// one script so a test can drop the link under a running manager.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRadio {
    script: Rc<RefCell<RadioScript>>,
}

pub const FAKE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

impl ScriptedRadio {
    pub fn joining_after(polls: u32) -> Self {
        let radio = Self::default();
        radio.join_after(polls);
        radio
    }

    pub fn never_joining() -> Self {
        Self::default()
    }

    pub fn join_after(&self, polls: u32) {
        self.script.borrow_mut().join_after = Some(polls.max(1));
    }

    pub fn never_join(&self) {
        self.script.borrow_mut().join_after = None;
    }

    pub fn drop_link(&self) {
        let mut script = self.script.borrow_mut();
        script.associated = false;
        script.began = false;
    }

    pub fn polls(&self) -> u32 {
        self.script.borrow().polls
    }

    pub fn begins(&self) -> u32 {
        self.script.borrow().begins
    }

    pub fn disconnects(&self) -> u32 {
        self.script.borrow().disconnects
    }

    pub fn link_info_snapshot(&self) -> LinkInfo {
        LinkInfo {
            ip: FAKE_IP,
            channel: 6,
        }
    }
}

impl Radio for ScriptedRadio {
    fn begin(&mut self, _network: &NetworkConfig) -> Result<(), RadioError> {
        let mut script = self.script.borrow_mut();
        script.began = true;
        script.polls_since_begin = 0;
        script.begins += 1;
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        let mut script = self.script.borrow_mut();
        script.polls += 1;
        if !script.associated && script.began {
            script.polls_since_begin += 1;
            if let Some(needed) = script.join_after {
                script.associated = script.polls_since_begin >= needed;
            }
        }
        script.associated
    }

    fn disconnect(&mut self) {
        let mut script = self.script.borrow_mut();
        script.associated = false;
        script.began = false;
        script.disconnects += 1;
    }

    fn rssi(&mut self) -> i8 {
        -67
    }

    fn link_info(&mut self) -> LinkInfo {
        self.link_info_snapshot()
    }
}

#[derive(Debug, Default)]
struct ListenerLog {
    armed_with: Option<(String, String)>,
    arms: u32,
    disarms: u32,
    services: u32,
    fail_arming: bool,
    pending: VecDeque<UpdatePoll>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeUpdateListener {
    log: Rc<RefCell<ListenerLog>>,
}

impl FakeUpdateListener {
    pub fn armed_with(&self) -> Option<(String, String)> {
        self.log.borrow().armed_with.clone()
    }

    pub fn arms(&self) -> u32 {
        self.log.borrow().arms
    }

    pub fn disarms(&self) -> u32 {
        self.log.borrow().disarms
    }

    pub fn services(&self) -> u32 {
        self.log.borrow().services
    }

    pub fn fail_arming(&self, fail: bool) {
        self.log.borrow_mut().fail_arming = fail;
    }

    pub fn finish_with(&self, bytes: u64) {
        self.log
            .borrow_mut()
            .pending
            .push_back(UpdatePoll::Completed { bytes });
    }
}

impl UpdateListener for FakeUpdateListener {
    fn arm(&mut self, hostname: &str, auth_token: &str) -> Result<(), UpdateError> {
        let mut log = self.log.borrow_mut();
        log.arms += 1;
        if log.fail_arming {
            return Err(UpdateError::Listener("port in use".to_string()));
        }
        log.armed_with = Some((hostname.to_string(), auth_token.to_string()));
        Ok(())
    }

    fn disarm(&mut self) {
        let mut log = self.log.borrow_mut();
        log.disarms += 1;
        log.armed_with = None;
    }

    fn service(&mut self) -> UpdatePoll {
        let mut log = self.log.borrow_mut();
        log.services += 1;
        log.pending.pop_front().unwrap_or(UpdatePoll::Idle)
    }
}

#[derive(Debug, Default)]
struct MemoryMedium {
    card_present: bool,
    files: HashMap<String, Vec<u8>>,
    fail_opens: bool,
    fail_writes: bool,
    mounts: u32,
    opens: u32,
}

/// In-memory card. Clones share the same medium.
#[derive(Debug, Clone, Default)]
pub struct MemoryVolume {
    medium: Rc<RefCell<MemoryMedium>>,
}

impl MemoryVolume {
    pub fn with_card() -> Self {
        let volume = Self::default();
        volume.insert_card();
        volume
    }

    pub fn without_card() -> Self {
        Self::default()
    }

    pub fn insert_card(&self) {
        self.medium.borrow_mut().card_present = true;
    }

    pub fn seed(&self, path: &str, contents: &str) {
        self.medium
            .borrow_mut()
            .files
            .insert(path.to_string(), contents.as_bytes().to_vec());
    }

    pub fn contents(&self, path: &str) -> Option<String> {
        self.medium
            .borrow()
            .files
            .get(path)
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    pub fn fail_opens(&self, fail: bool) {
        self.medium.borrow_mut().fail_opens = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.medium.borrow_mut().fail_writes = fail;
    }

    pub fn mount_count(&self) -> u32 {
        self.medium.borrow().mounts
    }

    pub fn open_count(&self) -> u32 {
        self.medium.borrow().opens
    }

    fn open(&self, path: &str, truncate: bool) -> io::Result<MemoryFile> {
        let mut medium = self.medium.borrow_mut();
        medium.opens += 1;
        if medium.fail_opens {
            return Err(io::Error::other("open refused"));
        }
        let file = medium.files.entry(path.to_string()).or_default();
        if truncate {
            file.clear();
        }
        Ok(MemoryFile {
            medium: self.medium.clone(),
            path: path.to_string(),
        })
    }
}

impl Volume for MemoryVolume {
    type File = MemoryFile;

    fn mount(&mut self) -> Result<(), MountError> {
        let mut medium = self.medium.borrow_mut();
        medium.mounts += 1;
        if medium.card_present {
            Ok(())
        } else {
            Err(MountError::NoCard)
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.medium.borrow().files.contains_key(path)
    }

    fn create(&mut self, path: &str) -> io::Result<MemoryFile> {
        self.open(path, true)
    }

    fn open_append(&mut self, path: &str) -> io::Result<MemoryFile> {
        self.open(path, false)
    }
}

pub struct MemoryFile {
    medium: Rc<RefCell<MemoryMedium>>,
    path: String,
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut medium = self.medium.borrow_mut();
        if medium.fail_writes {
            return Err(io::Error::other("write refused"));
        }
        medium
            .files
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenterEvent {
    Status(String),
    Connecting(String),
    Progress(u32),
    Connected(Ipv4Addr, u8),
    Signal(i8),
    Reading(f64, f64),
    Error(String),
}

#[derive(Debug, Default)]
pub struct RecordingPresenter {
    events: Vec<PresenterEvent>,
}

impl RecordingPresenter {
    pub fn events(&self) -> Vec<PresenterEvent> {
        self.events.clone()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn statuses(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                PresenterEvent::Status(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                PresenterEvent::Error(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn signals(&self) -> Vec<i8> {
        self.events
            .iter()
            .filter_map(|e| match e {
                PresenterEvent::Signal(dbm) => Some(*dbm),
                _ => None,
            })
            .collect()
    }

    pub fn readings(&self) -> Vec<(f64, f64)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                PresenterEvent::Reading(t, rh) => Some((*t, *rh)),
                _ => None,
            })
            .collect()
    }
}

impl Presenter for RecordingPresenter {
    fn show_status(&mut self, text: &str) {
        self.events.push(PresenterEvent::Status(text.to_string()));
    }

    fn show_connecting(&mut self, ssid: &str) {
        self.events.push(PresenterEvent::Connecting(ssid.to_string()));
    }

    fn show_connect_progress(&mut self, failed_polls: u32) {
        self.events.push(PresenterEvent::Progress(failed_polls));
    }

    fn show_connected(&mut self, ip: Ipv4Addr, channel: u8) {
        self.events.push(PresenterEvent::Connected(ip, channel));
    }

    fn show_signal(&mut self, rssi_dbm: i8) {
        self.events.push(PresenterEvent::Signal(rssi_dbm));
    }

    fn show_reading(&mut self, temperature_c: f64, relative_humidity_pct: f64) {
        self.events
            .push(PresenterEvent::Reading(temperature_c, relative_humidity_pct));
    }

    fn show_error(&mut self, text: &str) {
        self.events.push(PresenterEvent::Error(text.to_string()));
    }
}

/// Replays a fixed sequence of readings, then repeats the fallback.
#[derive(Debug, Clone)]
pub struct ScriptedSensor {
    queued: VecDeque<Option<Climate>>,
    fallback: Option<Climate>,
}

impl ScriptedSensor {
    pub fn steady(temperature_c: f64, relative_humidity_pct: f64) -> Self {
        Self {
            queued: VecDeque::new(),
            fallback: Some(Climate {
                temperature_c,
                relative_humidity_pct,
            }),
        }
    }

    pub fn sequence(readings: Vec<Option<Climate>>) -> Self {
        Self {
            queued: readings.into(),
            fallback: None,
        }
    }
}

impl ClimateSensor for ScriptedSensor {
    fn read(&mut self) -> Option<Climate> {
        self.queued.pop_front().unwrap_or(self.fallback)
    }
}
