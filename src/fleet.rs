//! Fleet ramp-up and orderly shutdown.

use crate::alarms::{AlarmDictionary, AlarmEventGenerator, AlarmTiming};
use crate::config::{ConfigError, SimulatorConfig};
use crate::connection::{Dialer, FeedConnection, FeedKind, FeedStats, RetryPolicy};
use crate::message::{BedId, DEFAULT_UNIT};
use crate::scheduler::{PeriodicMessageScheduler, DEFAULT_TICK};
use crate::template::{Template, TemplateSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// Staggering keeps startup from turning into a connection storm on the hub
const PER_BED_PAUSE_MS: u64 = 50;
const EVERY_FIFTH_PAUSE_S: u64 = 1;
const EVERY_TWENTY_FIFTH_PAUSE_S: u64 = 5 * 60;

/// Pauses inserted after each bed is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RampSchedule {
    pub per_bed: Duration,
    pub every_fifth: Duration,
    pub every_twenty_fifth: Duration,
}

impl Default for RampSchedule {
    fn default() -> Self {
        Self {
            per_bed: Duration::from_millis(PER_BED_PAUSE_MS),
            every_fifth: Duration::from_secs(EVERY_FIFTH_PAUSE_S),
            every_twenty_fifth: Duration::from_secs(EVERY_TWENTY_FIFTH_PAUSE_S),
        }
    }
}

impl RampSchedule {
    /// No pauses at all.
    pub fn immediate() -> Self {
        Self {
            per_bed: Duration::ZERO,
            every_fifth: Duration::ZERO,
            every_twenty_fifth: Duration::ZERO,
        }
    }

    /// Pause after creating bed `index` (0-based).
    pub fn pause_after(&self, index: usize) -> Duration {
        let mut pause = self.per_bed;
        if index != 0 && index % 5 == 0 {
            pause += self.every_fifth;
        }
        if index != 0 && index % 25 == 0 {
            pause += self.every_twenty_fifth;
        }
        pause
    }

    pub fn total_for(&self, bed_count: usize) -> Duration {
        (0..bed_count).map(|index| self.pause_after(index)).sum()
    }
}

/// One simulated bed and its feeds.
#[derive(Debug)]
pub struct Bed {
    id: BedId,
    vital_wave: FeedConnection,
    alarm: Option<FeedConnection>,
}

impl Bed {
    pub fn id(&self) -> &BedId {
        &self.id
    }

    pub fn vital_wave(&self) -> &FeedConnection {
        &self.vital_wave
    }

    pub fn alarm(&self) -> Option<&FeedConnection> {
        self.alarm.as_ref()
    }

    pub fn feeds(&self) -> impl Iterator<Item = &FeedConnection> {
        std::iter::once(&self.vital_wave).chain(self.alarm.iter())
    }

    pub async fn close(&self) {
        for feed in self.feeds() {
            feed.close().await;
        }
    }
}

/// Aggregate counters reported at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetReport {
    pub beds_started: usize,
    pub vital_wave: FeedStats,
    pub alarm: FeedStats,
}

/// Creates beds on the ramp schedule and tears them down on shutdown.
pub struct FleetOrchestrator {
    config: SimulatorConfig,
    vitals: Arc<Template>,
    waveform: Arc<Template>,
    alarm_template: Arc<Template>,
    alarms: Option<AlarmDictionary>,
    dialer: Arc<dyn Dialer>,
    unit: String,
    ramp: RampSchedule,
    tick: Duration,
    vital_wave_policy: RetryPolicy,
    alarm_policy: RetryPolicy,
    alarm_timing: AlarmTiming,
    seed: Option<u64>,
    beds: Vec<Bed>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl FleetOrchestrator {
    /// `alarms` must be present when the config enables alarms.
    pub fn new(
        config: SimulatorConfig,
        templates: TemplateSet,
        alarms: Option<AlarmDictionary>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, ConfigError> {
        if config.send_alarms && alarms.is_none() {
            return Err(ConfigError::EmptyAlarmDictionary(
                "alarms enabled but no dictionary loaded".to_string(),
            ));
        }

        Ok(Self {
            beds: Vec::with_capacity(config.bed_count),
            config,
            vitals: Arc::new(templates.vitals),
            waveform: Arc::new(templates.waveform),
            alarm_template: Arc::new(templates.alarm),
            alarms,
            dialer,
            unit: DEFAULT_UNIT.to_string(),
            ramp: RampSchedule::default(),
            tick: DEFAULT_TICK,
            vital_wave_policy: RetryPolicy::vital_wave(),
            alarm_policy: RetryPolicy::alarm(),
            alarm_timing: AlarmTiming::default(),
            seed: None,
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_ramp(mut self, ramp: RampSchedule) -> Self {
        self.ramp = ramp;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_retry_policies(mut self, vital_wave: RetryPolicy, alarm: RetryPolicy) -> Self {
        self.vital_wave_policy = vital_wave;
        self.alarm_policy = alarm;
        self
    }

    pub fn with_alarm_timing(mut self, timing: AlarmTiming) -> Self {
        self.alarm_timing = timing;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn beds(&self) -> &[Bed] {
        &self.beds
    }

    fn alarms_enabled(&self) -> bool {
        self.config.send_alarms && self.alarms.is_some()
    }

    /// Create bed `index` and spawn all of its tasks.
    fn start_bed(&mut self, index: usize) {
        let id = BedId::from_index(self.unit.clone(), index);

        let vital_wave = FeedConnection::new(
            id.clone(),
            FeedKind::VitalWave,
            Arc::clone(&self.dialer),
            self.vital_wave_policy,
        );
        let sender = vital_wave.spawn(&mut self.tasks, &self.cancel);

        for template in [&self.vitals, &self.waveform] {
            let scheduler =
                PeriodicMessageScheduler::new(id.clone(), Arc::clone(template)).with_tick(self.tick);
            self.tasks
                .spawn(scheduler.run(sender.clone(), self.cancel.clone()));
        }

        let alarm = match (&self.alarms, self.alarms_enabled()) {
            (Some(dictionary), true) => {
                let feed = FeedConnection::new(
                    id.clone(),
                    FeedKind::Alarm,
                    Arc::clone(&self.dialer),
                    self.alarm_policy,
                );
                let sender = feed.spawn(&mut self.tasks, &self.cancel);
                let generator = AlarmEventGenerator::new(
                    id.clone(),
                    dictionary.clone(),
                    Arc::clone(&self.alarm_template),
                )
                .with_timing(self.alarm_timing)
                .with_seed(self.seed.map(|seed| seed.wrapping_add(index as u64)));
                self.tasks.spawn(generator.run(sender, self.cancel.clone()));
                Some(feed)
            }
            _ => None,
        };

        self.beds.push(Bed {
            id,
            vital_wave,
            alarm,
        });
    }

    /// Create every configured bed on the ramp schedule. Returns the number of
    /// beds started, which is short of the target if `shutdown` fired.
    pub async fn ramp_up(&mut self, shutdown: &CancellationToken) -> usize {
        for index in self.beds.len()..self.config.bed_count {
            if shutdown.is_cancelled() {
                break;
            }
            self.start_bed(index);

            let pause = self.ramp.pause_after(index);
            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = time::sleep(pause) => {}
            }
        }
        self.beds.len()
    }

    /// Ramp up, keep sending until `shutdown` is cancelled, then close
    /// everything.
    pub async fn run(mut self, shutdown: CancellationToken) -> FleetReport {
        info!(config = %self.config, "starting bed fleet");

        let started = self.ramp_up(&shutdown).await;
        if started == self.config.bed_count {
            info!(beds = started, "All configured beds are now sending!");
        }

        shutdown.cancelled().await;
        self.shutdown().await
    }

    /// Stop every task and close every open connection.
    pub async fn shutdown(&mut self) -> FleetReport {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!("bed task panicked: {}", e);
                }
            }
        }

        for bed in &self.beds {
            bed.close().await;
        }

        let report = self.report();
        info!(
            beds = report.beds_started,
            vital_wave_frames = report.vital_wave.frames_sent,
            alarm_frames = report.alarm.frames_sent,
            reconnects = report.vital_wave.reconnects + report.alarm.reconnects,
            "bed fleet stopped"
        );
        report
    }

    pub fn report(&self) -> FleetReport {
        let mut report = FleetReport {
            beds_started: self.beds.len(),
            ..FleetReport::default()
        };
        for bed in &self.beds {
            report.vital_wave.merge(&bed.vital_wave.stats());
            if let Some(alarm) = &bed.alarm {
                report.alarm.merge(&alarm.stats());
            }
        }
        report
    }
}
