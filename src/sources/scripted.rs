use std::collections::VecDeque;
use std::time::Duration;

use super::EventSource;
use crate::error::SourceError;
use crate::processing::events::Event;
use crate::processing::trial::TrialRecord;

/// Replays pre-built event scripts, one per trial.
///
/// Each `clear` discards what is left of the current script and moves on to
/// the next one, the way a live buffer flush drops a previous trial's tail.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    scripts: VecDeque<VecDeque<Event>>,
    current: VecDeque<Event>,
    closed: bool,
}

impl ScriptedSource {
    pub fn new<I, S>(scripts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: IntoIterator<Item = Event>,
    {
        Self {
            scripts: scripts
                .into_iter()
                .map(|script| script.into_iter().collect())
                .collect(),
            current: VecDeque::new(),
            closed: false,
        }
    }

    /// Playback of a recorded session: one script per recorded trial.
    pub fn from_history(history: &[TrialRecord]) -> Self {
        Self::new(
            history
                .iter()
                .map(|record| record.events.iter().map(|recorded| recorded.event)),
        )
    }
}

impl EventSource for ScriptedSource {
    fn next_event(&mut self) -> Result<Option<Event>, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        Ok(self.current.pop_front())
    }

    fn clear(&mut self) -> Result<Vec<Event>, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        let drained = self.current.drain(..).collect();
        self.current = self.scripts.pop_front().unwrap_or_default();
        Ok(drained)
    }

    fn close(&mut self) -> Result<(), SourceError> {
        self.closed = true;
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(t: f64) -> Event {
        Event::Trigger {
            label: 1,
            timestamp: t,
        }
    }

    #[test]
    fn clear_advances_to_the_next_script() {
        let mut source = ScriptedSource::new(vec![vec![trigger(1.0), trigger(1.5)], vec![trigger(2.0)]]);
        assert_eq!(source.next_event().unwrap(), None);

        assert!(source.clear().unwrap().is_empty());
        assert_eq!(source.next_event().unwrap(), Some(trigger(1.0)));

        let stale = source.clear().unwrap();
        assert_eq!(stale, vec![trigger(1.5)]);
        assert_eq!(source.next_event().unwrap(), Some(trigger(2.0)));
        assert_eq!(source.next_event().unwrap(), None);
    }

    #[test]
    fn closed_source_refuses_reads() {
        let mut source = ScriptedSource::new(vec![vec![trigger(1.0)]]);
        source.close().unwrap();
        assert!(matches!(source.next_event(), Err(SourceError::Closed)));
    }
}
