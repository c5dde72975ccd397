//! One simulated robot: held state, periodic reporter, downlink handling

use crate::fleet::{FleetError, OutboundMessage};
use crate::state::{LocalTime, RobotState, ScheduleTask};
use serde::Serialize;
use solarbot_protocol::{
    commands, encoding, CleanRecord, Frame, Identifier, LoraParamSet, StartReply, TimeStatusBlock,
    UplinkTemplate, CONTROL_DOWNLINK, CONTROL_UPLINK,
};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Reporter cancel-flag poll granularity; bounds stop latency
const REPORTER_TICK: Duration = Duration::from_millis(100);

/// Construction parameters for a robot, resolved from its roster row
#[derive(Debug, Clone)]
pub struct RobotConfig {
    pub dev_eui: String,
    pub serial_number: u16,
    pub publish_topic: String,
    pub subscribe_topic: String,
    pub qos: u8,
    pub report_interval: Duration,
    pub alarm_fa: u32,
    pub alarm_fb: u16,
    pub alarm_fc: u32,
    pub alarm_fd: u16,
}

/// Point-in-time copy of everything the admin surface can see
#[derive(Debug, Clone, Serialize)]
pub struct RobotSnapshot {
    pub robot_id: String,
    pub serial_number: u16,
    pub publish_topic: String,
    pub subscribe_topic: String,
    pub sequence: u8,
    pub report_interval_seconds: u64,
    pub running: bool,
    /// Hours since the robot record was created
    pub working_duration: u16,
    pub data: RobotState,
}

/// A live simulated robot
///
/// Shared between the fleet manager and its reporter task via `Arc`. The
/// link back to the fleet is the outbound queue sender only, so dropping
/// the fleet's map entry (after `stop`) releases the robot.
pub struct Robot {
    dev_eui: String,
    serial_number: u16,
    publish_topic: String,
    subscribe_topic: String,
    qos: u8,
    report_interval: Duration,
    counter: AtomicU8,
    created_at: Instant,
    state: Mutex<RobotState>,
    outbound: mpsc::Sender<OutboundMessage>,
    template: Arc<UplinkTemplate>,
    stop: Arc<AtomicBool>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl Robot {
    #[must_use]
    pub fn new(
        config: RobotConfig,
        outbound: mpsc::Sender<OutboundMessage>,
        template: Arc<UplinkTemplate>,
    ) -> Self {
        let mut state = RobotState::default();
        state.module_eui.clone_from(&config.dev_eui);
        state.local_time = LocalTime::now();
        state.alarm_fa = solarbot_protocol::FaultAlarms::from_bits_retain(config.alarm_fa);
        state.alarm_fb = solarbot_protocol::BatteryAlarms::from_bits_retain(config.alarm_fb);
        state.alarm_fc = solarbot_protocol::MotorAlarms::from_bits_retain(config.alarm_fc);
        state.alarm_fd = solarbot_protocol::EnvironmentAlarms::from_bits_retain(config.alarm_fd);

        Self {
            dev_eui: config.dev_eui,
            serial_number: config.serial_number,
            publish_topic: config.publish_topic,
            subscribe_topic: config.subscribe_topic,
            qos: config.qos,
            report_interval: config.report_interval,
            counter: AtomicU8::new(0),
            created_at: Instant::now(),
            state: Mutex::new(state),
            outbound,
            template,
            stop: Arc::new(AtomicBool::new(false)),
            reporter: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn dev_eui(&self) -> &str {
        &self.dev_eui
    }

    #[must_use]
    pub fn serial_number(&self) -> u16 {
        self.serial_number
    }

    #[must_use]
    pub fn subscribe_topic(&self) -> &str {
        &self.subscribe_topic
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Relaxed) && self.reporter.lock().unwrap().is_some()
    }

    /// Next frame counter value, wrapping at 256
    fn next_counter(&self) -> u8 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    fn working_hours(&self) -> u16 {
        u16::try_from(self.created_at.elapsed().as_secs() / 3600).unwrap_or(u16::MAX)
    }

    /// Start the periodic reporter task
    ///
    /// The loop waits `report_interval` between reports, polling the
    /// cancel flag every [`REPORTER_TICK`] so `stop` completes promptly.
    pub fn start_reporter(self: &Arc<Self>) {
        let robot = Arc::clone(self);
        let stop = Arc::clone(&self.stop);

        let handle = tokio::spawn(async move {
            tracing::debug!("[{}] reporter started", robot.dev_eui);
            'report: loop {
                let mut waited = Duration::ZERO;
                while waited < robot.report_interval {
                    if stop.load(Ordering::Relaxed) {
                        break 'report;
                    }
                    let step = REPORTER_TICK.min(robot.report_interval - waited);
                    tokio::time::sleep(step).await;
                    waited += step;
                }
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = robot.send_report() {
                    tracing::warn!("[{}] report not sent: {}", robot.dev_eui, e);
                }
            }
            tracing::debug!("[{}] reporter stopped", robot.dev_eui);
        });

        *self.reporter.lock().unwrap() = Some(handle);
    }

    /// Signal the reporter to stop and wait for it to finish
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let handle = self.reporter.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Encode a frame, wrap it in the envelope and push it onto the
    /// outbound queue. Fails fast when the queue is full.
    fn enqueue_frame(&self, control_code: u8, payload: Vec<u8>) -> Result<(), FleetError> {
        let frame = Frame::new(control_code, self.serial_number, self.next_counter(), payload);
        let bytes = frame.encode();
        tracing::debug!("[{}] uplink frame: {}", self.dev_eui, encoding::to_hex(&bytes));

        let envelope = self.template.render(&self.dev_eui, &bytes);
        self.outbound
            .try_send(OutboundMessage {
                topic: self.publish_topic.clone(),
                payload: envelope.into_bytes(),
                qos: self.qos,
            })
            .map_err(|_| FleetError::QueueFull)
    }

    /// Build and enqueue one periodic telemetry report
    #[allow(clippy::missing_errors_doc)]
    pub fn send_report(&self) -> Result<(), FleetError> {
        let payload = self.report_payload();
        self.enqueue_frame(CONTROL_UPLINK, payload)
    }

    fn report_payload(&self) -> Vec<u8> {
        let working_hours = self.working_hours();
        let state = self.state.lock().unwrap();
        let mut p = Vec::with_capacity(21);
        p.push(Identifier::Report as u8);
        p.extend_from_slice(&state.battery_voltage.to_be_bytes());
        p.extend_from_slice(&state.battery_current.to_be_bytes());
        p.push(state.battery_level);
        p.push(state.battery_temperature as u8);
        p.extend_from_slice(&state.main_motor_current.to_be_bytes());
        p.extend_from_slice(&state.slave_motor_current.to_be_bytes());
        p.extend_from_slice(&state.solar_voltage.to_be_bytes());
        p.extend_from_slice(&state.solar_current.to_be_bytes());
        p.push(state.board_temperature as u8);
        p.extend_from_slice(&working_hours.to_be_bytes());
        p.extend_from_slice(&state.total_run_count.to_be_bytes());
        p.push(state.current_lap_count);
        p
    }

    /// Operator-triggered scheduled-start request
    #[allow(clippy::missing_errors_doc)]
    pub fn send_schedule_start(
        &self,
        task_id: u8,
        weekday: u8,
        hour: u8,
        minute: u8,
        run_count: u8,
    ) -> Result<(), FleetError> {
        {
            let mut state = self.state.lock().unwrap();
            let task = ScheduleTask {
                task_id,
                weekday,
                hour,
                minute,
                run_count,
            };
            match state.schedule_tasks.iter_mut().find(|t| t.task_id == task_id) {
                Some(existing) => *existing = task,
                None => state.schedule_tasks.push(task),
            }
        }
        self.enqueue_frame(
            CONTROL_DOWNLINK,
            commands::schedule_start_request(task_id, weekday, hour, minute, run_count),
        )
    }

    /// Operator-triggered start request
    #[allow(clippy::missing_errors_doc)]
    pub fn send_start(&self) -> Result<(), FleetError> {
        self.enqueue_frame(CONTROL_DOWNLINK, commands::start_request())
    }

    /// Operator-triggered time-sync request
    #[allow(clippy::missing_errors_doc)]
    pub fn send_time_sync(&self) -> Result<(), FleetError> {
        self.enqueue_frame(CONTROL_DOWNLINK, commands::time_sync_request())
    }

    /// Handle one raw downlink frame (already base64-decoded)
    ///
    /// Malformed frames are logged and dropped; they never affect state.
    pub fn handle(&self, raw: &[u8]) {
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("[{}] dropping undecodable frame: {}", self.dev_eui, e);
                return;
            }
        };

        let Some(id_byte) = frame.identifier() else {
            tracing::warn!("[{}] dropping frame with empty payload", self.dev_eui);
            return;
        };

        match Identifier::from_u8(id_byte) {
            Some(Identifier::SetLoraParams) => self.apply_lora_params(frame.params()),
            Some(Identifier::CleanRecordUpload) => self.upload_clean_records(),
            Some(id @ (Identifier::ScheduleStartReply | Identifier::StartReply)) => {
                self.apply_start_reply(id, frame.params());
            }
            Some(Identifier::TimeSync) => self.apply_time_sync(frame.params()),
            _ => {
                tracing::warn!(
                    "[{}] unknown downlink identifier {:#04X}, dropping",
                    self.dev_eui,
                    id_byte
                );
            }
        }
    }

    fn warn_trailing(&self, command: &str, params: &[u8], expected: usize) {
        if params.len() > expected {
            tracing::warn!(
                "[{}] {} carried {} extra bytes, ignoring",
                self.dev_eui,
                command,
                params.len() - expected
            );
        }
    }

    fn apply_lora_params(&self, params: &[u8]) {
        let set = match LoraParamSet::parse(params) {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!("[{}] bad LoRa parameter payload: {}", self.dev_eui, e);
                return;
            }
        };
        self.warn_trailing("set-lora-params", params, 3);

        self.state.lock().unwrap().lora_params = set;
        tracing::info!(
            "[{}] LoRa params set: power={} frequency={} rate={}",
            self.dev_eui,
            set.power,
            set.frequency,
            set.rate
        );

        if let Err(e) = self.enqueue_frame(CONTROL_UPLINK, set.confirmation_payload()) {
            tracing::warn!("[{}] LoRa confirmation not sent: {}", self.dev_eui, e);
        }
    }

    fn upload_clean_records(&self) {
        let records: Vec<CleanRecord> = {
            let state = self.state.lock().unwrap();
            state.clean_records.clone()
        };
        tracing::info!(
            "[{}] uploading {} cleaning records",
            self.dev_eui,
            records.len()
        );
        if let Err(e) = self.enqueue_frame(CONTROL_UPLINK, commands::clean_record_upload(&records)) {
            tracing::warn!("[{}] record upload not sent: {}", self.dev_eui, e);
        }
    }

    fn apply_start_reply(&self, id: Identifier, params: &[u8]) {
        let reply = match StartReply::parse(params) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("[{}] bad {:?} payload: {}", self.dev_eui, id, e);
                return;
            }
        };
        self.warn_trailing("start reply", params, 1 + commands::TIME_STATUS_BLOCK_LEN);

        let mut state = self.state.lock().unwrap();
        apply_block_time(&mut state.local_time, &reply.block);
        state.environment.wind_speed = reply.block.wind_speed;
        state.environment.protection = reply.block.protection;
        state.site_box_count = reply.block.box_count;
        state.site_robot_count = reply.block.robot_count;
        drop(state);

        tracing::info!(
            "[{}] {:?}: start_flag={} wind={} protection={:#03X}",
            self.dev_eui,
            id,
            reply.start_flag,
            reply.block.wind_speed,
            reply.block.protection.to_byte()
        );
    }

    fn apply_time_sync(&self, params: &[u8]) {
        let block = match TimeStatusBlock::parse(params) {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!("[{}] bad time-sync payload: {}", self.dev_eui, e);
                return;
            }
        };
        self.warn_trailing("time sync", params, commands::TIME_STATUS_BLOCK_LEN);

        let mut state = self.state.lock().unwrap();
        apply_block_time(&mut state.local_time, &block);
        drop(state);

        tracing::info!(
            "[{}] clock synced to {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.dev_eui,
            block.year,
            block.month,
            block.day,
            block.hour,
            block.minute,
            block.second
        );
    }

    /// Produce a consistent point-in-time snapshot for the admin surface
    #[must_use]
    pub fn describe(&self) -> RobotSnapshot {
        let data = self.state.lock().unwrap().clone();
        RobotSnapshot {
            robot_id: self.dev_eui.clone(),
            serial_number: self.serial_number,
            publish_topic: self.publish_topic.clone(),
            subscribe_topic: self.subscribe_topic.clone(),
            sequence: self.counter.load(Ordering::Relaxed),
            report_interval_seconds: self.report_interval.as_secs(),
            running: self.is_running(),
            working_duration: self.working_hours(),
            data,
        }
    }
}

fn apply_block_time(local: &mut LocalTime, block: &TimeStatusBlock) {
    local.year = block.year;
    local.month = block.month;
    local.day = block.day;
    local.hour = block.hour;
    local.minute = block.minute;
    local.second = block.second;
    local.weekday = block.weekday;
}

#[cfg(test)]
mod tests {
    use super::*;
    use solarbot_protocol::DownlinkEnvelope;

    fn test_robot(interval: Duration) -> (Arc<Robot>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let robot = Robot::new(
            RobotConfig {
                dev_eui: "303930306350729d".to_string(),
                serial_number: 2,
                publish_topic: "app/device/303930306350729d/event/up".to_string(),
                subscribe_topic: "app/device/303930306350729d/command/down".to_string(),
                qos: 1,
                report_interval: interval,
                alarm_fa: 0,
                alarm_fb: 0,
                alarm_fc: 0,
                alarm_fd: 0,
            },
            tx,
            Arc::new(UplinkTemplate::default()),
        );
        (Arc::new(robot), rx)
    }

    fn downlink(robot: &Robot, counter: u8, payload: Vec<u8>) -> Vec<u8> {
        Frame::new(CONTROL_DOWNLINK, robot.serial_number(), counter, payload).encode()
    }

    /// Decode the frame carried by a queued uplink envelope
    fn unwrap_uplink(msg: &OutboundMessage) -> Frame {
        let envelope =
            DownlinkEnvelope::parse("app/device/303930306350729d/event/up", &msg.payload).unwrap();
        Frame::decode(&envelope.data).unwrap()
    }

    #[tokio::test]
    async fn test_report_frame_shape() {
        let (robot, mut rx) = test_robot(Duration::from_secs(10));
        robot.send_report().unwrap();

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.topic, "app/device/303930306350729d/event/up");
        assert_eq!(msg.qos, 1);

        let frame = unwrap_uplink(&msg);
        assert_eq!(frame.control_code, CONTROL_UPLINK);
        assert_eq!(frame.number, 2);
        assert_eq!(frame.counter, 0);
        assert_eq!(frame.identifier(), Some(Identifier::Report as u8));
        assert_eq!(frame.payload.len(), 21);
    }

    #[tokio::test]
    async fn test_counter_is_contiguous_mod_256() {
        let (robot, mut rx) = test_robot(Duration::from_secs(10));
        for i in 0..260u32 {
            robot.send_start().unwrap();
            let frame = unwrap_uplink(&rx.try_recv().unwrap());
            assert_eq!(u32::from(frame.counter), i % 256);
        }
    }

    #[tokio::test]
    async fn test_lora_params_downlink_updates_and_confirms() {
        let (robot, mut rx) = test_robot(Duration::from_secs(10));
        robot.handle(&downlink(&robot, 0, vec![0xA4, 0x14, 0x50, 0x01]));

        let snapshot = robot.describe();
        assert_eq!(snapshot.data.lora_params.power, 0x14);
        assert_eq!(snapshot.data.lora_params.frequency, 0x50);
        assert_eq!(snapshot.data.lora_params.rate, 0x01);

        let frame = unwrap_uplink(&rx.try_recv().unwrap());
        assert_eq!(frame.control_code, CONTROL_UPLINK);
        assert_eq!(frame.payload, vec![0xA4, 0x14, 0x50, 0x01]);
    }

    #[tokio::test]
    async fn test_short_time_sync_leaves_clock_unchanged() {
        let (robot, mut rx) = test_robot(Duration::from_secs(10));
        let before = robot.describe().data.local_time;

        // Identifier only, no parameter block: a length error
        robot.handle(&downlink(&robot, 0, vec![0xF2]));

        assert_eq!(robot.describe().data.local_time, before);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_time_sync_updates_clock() {
        let (robot, _rx) = test_robot(Duration::from_secs(10));
        let mut payload = vec![0xF2];
        payload.extend([26, 8, 2, 14, 30, 45, 0, 0x00, 0x2A, 0x00, 0x08, 3, 0x00]);
        robot.handle(&downlink(&robot, 0, payload));

        let time = robot.describe().data.local_time;
        assert_eq!(time.year, 2026);
        assert_eq!(time.month, 8);
        assert_eq!(time.hour, 14);
        // Time sync does not touch the environment
        assert_eq!(robot.describe().data.environment.wind_speed, 0);
    }

    #[tokio::test]
    async fn test_start_reply_updates_environment() {
        let (robot, _rx) = test_robot(Duration::from_secs(10));
        let mut payload = vec![0xF1, 0x01];
        payload.extend([26, 8, 2, 14, 30, 45, 0, 0x00, 0x2A, 0x00, 0x08, 3, 0x05]);
        robot.handle(&downlink(&robot, 0, payload));

        let data = robot.describe().data;
        assert_eq!(data.local_time.year, 2026);
        assert_eq!(data.environment.wind_speed, 42);
        assert!(data.environment.protection.wind);
        assert!(data.environment.protection.bracket);
        assert_eq!(data.site_box_count, 8);
        assert_eq!(data.site_robot_count, 3);
    }

    #[tokio::test]
    async fn test_clean_record_request_uploads() {
        let (robot, mut rx) = test_robot(Duration::from_secs(10));
        robot.handle(&downlink(&robot, 0, vec![0xE9]));

        let frame = unwrap_uplink(&rx.try_recv().unwrap());
        assert_eq!(frame.identifier(), Some(0xE9));
        assert_eq!(frame.payload[1], 0); // fresh robot has no records
    }

    #[tokio::test]
    async fn test_unknown_identifier_is_dropped() {
        let (robot, mut rx) = test_robot(Duration::from_secs(10));
        robot.handle(&downlink(&robot, 0, vec![0x99, 0x01]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_dropped() {
        let (robot, mut rx) = test_robot(Duration::from_secs(10));
        let mut bytes = downlink(&robot, 0, vec![0xF2]);
        bytes[2] ^= 0xFF; // breaks the checksum
        robot.handle(&bytes);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_schedule_start_registers_task() {
        let (robot, mut rx) = test_robot(Duration::from_secs(10));
        robot.send_schedule_start(1, 3, 9, 30, 2).unwrap();

        let frame = unwrap_uplink(&rx.try_recv().unwrap());
        assert_eq!(frame.control_code, CONTROL_DOWNLINK);
        assert_eq!(frame.payload, vec![0xF0, 1, 3, 9, 30, 2]);

        let tasks = robot.describe().data.schedule_tasks;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].hour, 9);

        // Re-sending the same task id replaces, not duplicates
        robot.send_schedule_start(1, 3, 10, 0, 2).unwrap();
        let tasks = robot.describe().data.schedule_tasks;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].hour, 10);
    }

    #[tokio::test]
    async fn test_reporter_cadence_and_stop() {
        let (robot, mut rx) = test_robot(Duration::from_millis(200));
        robot.start_reporter();
        assert!(robot.is_running());

        tokio::time::sleep(Duration::from_millis(700)).await;
        robot.stop().await;
        assert!(!robot.is_running());

        let mut frames = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            frames.push(unwrap_uplink(&msg));
        }
        // ~700 ms / 200 ms, one either side for scheduling slack
        assert!(
            (2..=4).contains(&frames.len()),
            "expected 2..=4 reports, got {}",
            frames.len()
        );
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.counter as usize, i);
        }

        // No further reports after stop
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        let (tx, _rx) = mpsc::channel(1);
        let robot = Robot::new(
            RobotConfig {
                dev_eui: "aabbccdd00112233".to_string(),
                serial_number: 7,
                publish_topic: "up".to_string(),
                subscribe_topic: "down".to_string(),
                qos: 0,
                report_interval: Duration::from_secs(10),
                alarm_fa: 0,
                alarm_fb: 0,
                alarm_fc: 0,
                alarm_fd: 0,
            },
            tx,
            Arc::new(UplinkTemplate::default()),
        );
        robot.send_start().unwrap();
        assert!(matches!(robot.send_start(), Err(FleetError::QueueFull)));
    }
}
