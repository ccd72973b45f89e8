use crate::connection::FeedSender;
use crate::message::{BedId, MessageContext};
use crate::template::{Template, TemplateKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

// Vitals and waveform are both sent at 1 Hz
pub const DEFAULT_TICK: Duration = Duration::from_millis(1000);

/// Renders one message kind for one bed on a fixed cadence.
#[derive(Debug, Clone)]
pub struct PeriodicMessageScheduler {
    bed: BedId,
    template: Arc<Template>,
    tick: Duration,
}

impl PeriodicMessageScheduler {
    pub fn new(bed: BedId, template: Arc<Template>) -> Self {
        Self {
            bed,
            template,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn kind(&self) -> TemplateKind {
        self.template.kind()
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Body for the current instant.
    pub fn render_now(&self) -> String {
        self.template.render(&MessageContext::now(&self.bed))
    }

    /// Submit a fresh message every tick until cancelled. Never waits on the
    /// connection: whatever cannot be sent is dropped by the feed.
    pub async fn run(self, sender: FeedSender, cancel: CancellationToken) {
        let mut interval = time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if !sender.submit(self.render_now()) {
                debug!(bed = %self.bed, kind = self.kind().name(), "message not queued");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vitals_scheduler() -> PeriodicMessageScheduler {
        let template =
            Template::parse(TemplateKind::Vitals, "MSH|{{.Unit}}|{{.Bed}}|{{.Datetime}}|{{.DatetimeSub1}}").unwrap();
        PeriodicMessageScheduler::new(BedId::from_index("LABMR", 5), Arc::new(template))
    }

    #[test]
    fn test_scheduler_defaults() {
        let scheduler = vitals_scheduler();
        assert_eq!(scheduler.tick(), Duration::from_secs(1));
        assert_eq!(scheduler.kind(), TemplateKind::Vitals);
    }

    #[test]
    fn test_render_now_uses_bed_identity_and_fresh_timestamps() {
        let body = vitals_scheduler().render_now();
        let fields: Vec<&str> = body.split('|').collect();
        assert_eq!(fields[1], "LABMR");
        assert_eq!(fields[2], "5");
        // YYYYMMDDHHMMSS.ffff±HHMM
        assert_eq!(fields[3].len(), 24);
        assert_eq!(&fields[3][14..15], ".");
        assert!(matches!(&fields[3][19..20], "+" | "-"));
        assert_ne!(fields[3], fields[4]);
    }
}
