//! Alarm dictionary and the randomized start/end alarm generator.

use crate::config::ConfigError;
use crate::connection::FeedSender;
use crate::message::{AlarmContext, BedId};
use crate::template::Template;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_ALARM_DICTIONARY: &str = "Alarms/AlarmDict.csv";

const CRISIS_TOKEN: &str = "H~PH~SP";
const WARNING_TOKEN: &str = "H~PM~SP";
const ADVISORY_TOKEN: &str = "H~PL~SP";
const SYSTEM_TOKEN: &str = "H~PM~ST";

// Whole-unit ranges, inclusive
const IDLE_MINUTES: (u64, u64) = (1, 10);
const HOLD_SECONDS: (u64, u64) = (1, 60);
const COOLDOWN_MINUTES: (u64, u64) = (1, 30);

/// One (name, code) row of the alarm dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmDefinition {
    pub name: String,
    pub code: String,
}

impl AlarmDefinition {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
        }
    }
}

/// Immutable, non-empty list of alarm definitions shared by every bed.
#[derive(Debug, Clone)]
pub struct AlarmDictionary {
    alarms: Arc<[AlarmDefinition]>,
}

impl AlarmDictionary {
    pub fn new(alarms: Vec<AlarmDefinition>) -> Result<Self, ConfigError> {
        if alarms.is_empty() {
            return Err(ConfigError::EmptyAlarmDictionary("<inline>".to_string()));
        }
        Ok(Self {
            alarms: alarms.into(),
        })
    }

    /// Load a header-less CSV file. Rows with fewer than two fields are skipped.
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let csv_error = |source| ConfigError::AlarmDictionary {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(csv_error)?;

        let mut alarms = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            if let (Some(name), Some(code)) = (record.get(0), record.get(1)) {
                alarms.push(AlarmDefinition::new(name, code));
            }
        }

        if alarms.is_empty() {
            return Err(ConfigError::EmptyAlarmDictionary(path.display().to_string()));
        }

        Ok(Self {
            alarms: alarms.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&AlarmDefinition> {
        self.alarms.get(index)
    }

    /// Pick a definition uniformly at random.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> &AlarmDefinition {
        &self.alarms[rng.random_range(0..self.alarms.len())]
    }
}

/// Alarm severity level 1..=4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    System = 1,
    Advisory = 2,
    Warning = 3,
    Crisis = 4,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::System,
        Severity::Advisory,
        Severity::Warning,
        Severity::Crisis,
    ];

    /// Anything outside 2..=4 maps to `System`.
    pub fn from_level(level: u8) -> Self {
        match level {
            4 => Severity::Crisis,
            3 => Severity::Warning,
            2 => Severity::Advisory,
            _ => Severity::System,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn priority_token(self) -> &'static str {
        match self {
            Severity::Crisis => CRISIS_TOKEN,
            Severity::Warning => WARNING_TOKEN,
            Severity::Advisory => ADVISORY_TOKEN,
            Severity::System => SYSTEM_TOKEN,
        }
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::from_level(rng.random_range(1..=4))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmPhase {
    Start,
    End,
}

impl AlarmPhase {
    pub fn start_token(self) -> &'static str {
        match self {
            AlarmPhase::Start => "start",
            AlarmPhase::End => "end",
        }
    }

    pub fn active_token(self) -> &'static str {
        match self {
            AlarmPhase::Start => "active",
            AlarmPhase::End => "inactive",
        }
    }
}

/// The alarm emitted as a Start/End pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub name: String,
    pub code: String,
    pub severity: Severity,
}

impl AlarmRecord {
    pub fn context(&self, bed: &BedId, phase: AlarmPhase) -> AlarmContext {
        AlarmContext {
            unit: bed.unit.clone(),
            bed: bed.bed.clone(),
            patient_id: bed.patient_id(),
            patient_last: bed.patient_last(),
            patient_first: bed.patient_first(),
            alarm_code: self.code.clone(),
            alarm_text: self.name.clone(),
            alarm_level: self.severity.priority_token().to_string(),
            start: phase.start_token().to_string(),
            active: phase.active_token().to_string(),
        }
    }
}

/// Inclusive range of whole `unit`s, sampled uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniformDelay {
    pub min: u64,
    pub max: u64,
    pub unit: Duration,
}

impl UniformDelay {
    pub fn minutes(min: u64, max: u64) -> Self {
        Self {
            min,
            max,
            unit: Duration::from_secs(60),
        }
    }

    pub fn seconds(min: u64, max: u64) -> Self {
        Self {
            min,
            max,
            unit: Duration::from_secs(1),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let count = rng.random_range(self.min..=self.max.max(self.min));
        self.unit * u32::try_from(count).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmTiming {
    /// Before the first alarm.
    pub idle: UniformDelay,
    /// Between Start and End.
    pub hold: UniformDelay,
    /// Between End and the next Start.
    pub cooldown: UniformDelay,
}

impl Default for AlarmTiming {
    fn default() -> Self {
        Self {
            idle: UniformDelay::minutes(IDLE_MINUTES.0, IDLE_MINUTES.1),
            hold: UniformDelay::seconds(HOLD_SECONDS.0, HOLD_SECONDS.1),
            cooldown: UniformDelay::minutes(COOLDOWN_MINUTES.0, COOLDOWN_MINUTES.1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeverityChoice {
    #[default]
    Random,
    Fixed(Severity),
}

/// Per-bed generator of Start/End alarm pairs.
#[derive(Debug)]
pub struct AlarmEventGenerator {
    bed: BedId,
    dictionary: AlarmDictionary,
    template: Arc<Template>,
    timing: AlarmTiming,
    severity: SeverityChoice,
    rng: SmallRng,
}

impl AlarmEventGenerator {
    pub fn new(bed: BedId, dictionary: AlarmDictionary, template: Arc<Template>) -> Self {
        Self {
            bed,
            dictionary,
            template,
            timing: AlarmTiming::default(),
            severity: SeverityChoice::Random,
            rng: SmallRng::from_os_rng(),
        }
    }

    pub fn with_timing(mut self, timing: AlarmTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_severity(mut self, severity: SeverityChoice) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.rng = match seed {
            Some(s) => SmallRng::seed_from_u64(s),
            None => SmallRng::from_os_rng(),
        };
        self
    }

    pub fn bed(&self) -> &BedId {
        &self.bed
    }

    /// Pick the next alarm definition and severity.
    pub fn next_record(&mut self) -> AlarmRecord {
        let definition = self.dictionary.choose(&mut self.rng).clone();
        let severity = match self.severity {
            SeverityChoice::Random => Severity::random(&mut self.rng),
            SeverityChoice::Fixed(severity) => severity,
        };
        AlarmRecord {
            name: definition.name,
            code: definition.code,
            severity,
        }
    }

    pub fn render(&self, record: &AlarmRecord, phase: AlarmPhase) -> String {
        self.template.render(&record.context(&self.bed, phase))
    }

    /// Idle, then emit Start/End pairs until cancelled.
    pub async fn run(mut self, sender: FeedSender, cancel: CancellationToken) {
        let idle = self.timing.idle.sample(&mut self.rng);
        debug!(bed = %self.bed, ?idle, "alarm generator idle");
        if !sleep_or_cancel(idle, &cancel).await {
            return;
        }

        loop {
            let record = self.next_record();

            sender.submit(self.render(&record, AlarmPhase::Start));
            info!(
                bed = %self.bed,
                code = %record.code,
                severity = record.severity.level(),
                "sent alarm {} for {} _ {}",
                record.name,
                self.bed.unit,
                self.bed.bed
            );

            let hold = self.timing.hold.sample(&mut self.rng);
            if !sleep_or_cancel(hold, &cancel).await {
                return;
            }

            sender.submit(self.render(&record, AlarmPhase::End));
            debug!(bed = %self.bed, code = %record.code, "ended alarm {}", record.name);

            let cooldown = self.timing.cooldown.sample(&mut self.rng);
            if !sleep_or_cancel(cooldown, &cancel).await {
                return;
            }
        }
    }
}

/// Returns `false` if cancelled before `duration` elapsed.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = time::sleep(duration) => true,
    }
}
