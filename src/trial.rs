use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::pairing::SubsetRemap;
use crate::session::{SessionState, SessionStore, TrialRecord};
use crate::stimulus::StimulusSet;

/// Playback seam. `play` blocks until the buffer has been fully handed to
/// the device; the inter-stimulus gap on top of that is the controller's.
pub trait AudioSink {
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()>;
}

/// 5-point preference judgment; positive favors the first stimulus (A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Judgment(i8);

impl Judgment {
    pub fn new(value: i8) -> Result<Self> {
        if (-2..=2).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidJudgment(value as i64))
        }
    }

    pub fn value(self) -> i8 {
        self.0
    }
}

impl std::str::FromStr for Judgment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let v: i64 = s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidJudgment(i64::MIN))?;
        let v8 = i8::try_from(v).map_err(|_| Error::InvalidJudgment(v))?;
        Self::new(v8)
    }
}

/// Where the controller is within the per-trial lifecycle. The "no session"
/// idle state is the absence of a controller; one only exists for a loaded
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPhase {
    /// Session loaded, next trial not yet started.
    ReadyToStart,
    /// Stimulus pair in flight; response input locked. Also held here after
    /// a playback failure so the operator can retry.
    Playing,
    /// Both stimuli presented; response input unlocked.
    AwaitingResponse,
    /// Every trial presented and judged.
    Complete,
    /// Unrecoverable persistence failure; everything stays locked.
    Faulted,
}

/// Per-trial state machine. Each `submit` records the judgment of the trial
/// just heard and immediately runs the next trial's playback, mirroring the
/// single advance control of the original experiment.
#[derive(Debug)]
pub struct TrialController<'a, S: AudioSink> {
    set: &'a StimulusSet,
    store: &'a SessionStore,
    state: SessionState,
    participant: String,
    sink: S,
    gap: Duration,
    phase: TrialPhase,
    /// Remapped stimulus indices of the in-flight or just-heard pair.
    current_pair: Option<(u32, u32)>,
}

impl<'a, S: AudioSink> TrialController<'a, S> {
    /// Attach to a loaded session. A session resumed past a crash continues
    /// with the trial after the last persisted one; an in-flight judgment
    /// that was never submitted is lost by design.
    pub fn resume(
        set: &'a StimulusSet,
        store: &'a SessionStore,
        state: SessionState,
        participant: String,
        sink: S,
        gap: Duration,
    ) -> Result<Self> {
        let scheduled = state.pairing().stimulus_count();
        let full = set.len() as u32;
        let consistent = if state.pilot() {
            scheduled >= 2 && scheduled <= full
        } else {
            scheduled == full
        };
        if !consistent {
            return Err(Error::InvalidState(format!(
                "session was scheduled over {scheduled} stimuli but the bank holds {full}"
            )));
        }
        let phase = if state.is_complete() {
            TrialPhase::Complete
        } else {
            TrialPhase::ReadyToStart
        };
        Ok(Self {
            set,
            store,
            state,
            participant,
            sink,
            gap,
            phase,
            current_pair: None,
        })
    }

    pub fn phase(&self) -> TrialPhase {
        self.phase
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Remapped indices of the pair currently in flight or awaiting a
    /// judgment.
    pub fn current_pair(&self) -> Option<(u32, u32)> {
        self.current_pair
    }

    fn remap(&self) -> SubsetRemap {
        SubsetRemap {
            scheduled: self.state.pairing().stimulus_count(),
            full: self.set.len() as u32,
        }
    }

    /// Run the next trial's playback. On success the response input is
    /// considered unlocked (`AwaitingResponse`). A playback failure holds
    /// the controller in `Playing` with the counter untouched; `retry`
    /// re-presents the same trial from stimulus A.
    pub fn start(&mut self) -> Result<()> {
        if self.phase != TrialPhase::ReadyToStart {
            return Err(Error::InvalidState(format!(
                "start is not accepted in {:?}",
                self.phase
            )));
        }
        if self.state.is_complete() {
            self.phase = TrialPhase::Complete;
            return Err(Error::SessionComplete {
                total: self.state.total_trials(),
            });
        }
        let index = self.state.trial_counter() as usize;
        let pair = self
            .state
            .pairing()
            .pair_at(index)
            .ok_or_else(|| Error::InvalidState(format!("no pair at trial index {index}")))?;
        let pair = self.remap().apply_pair(pair);
        self.current_pair = Some(pair);
        self.phase = TrialPhase::Playing;
        info!(
            trial = index + 1,
            total = self.state.total_trials(),
            first = pair.0 + 1,
            second = pair.1 + 1,
            "trial started"
        );
        self.run_playback()
    }

    /// Re-present the current trial after a playback failure.
    pub fn retry(&mut self) -> Result<()> {
        if self.phase != TrialPhase::Playing {
            return Err(Error::InvalidState(format!(
                "retry is not accepted in {:?}",
                self.phase
            )));
        }
        self.run_playback()
    }

    fn run_playback(&mut self) -> Result<()> {
        let (first, second) = self.current_pair.expect("pair set before playback");
        let set = self.set;
        let rate = set.sample_rate();
        let a = set
            .variant(first as usize)
            .ok_or_else(|| Error::InvalidState(format!("no stimulus {first}")))?;
        let b = set
            .variant(second as usize)
            .ok_or_else(|| Error::InvalidState(format!("no stimulus {second}")))?;

        // Strict sequence: A, gap, B, gap. The sink blocks until each
        // buffer is drained, so B cannot begin before A plus the gap.
        if let Err(e) = self
            .play_with_gap(a, rate)
            .and_then(|()| self.play_with_gap(b, rate))
        {
            warn!(error = %e, "playback failed; trial held for retry");
            return Err(e);
        }

        // Commit point: the trial counts as presented only once playback
        // finished, and the counter is persisted before the response input
        // unlocks. A crash from here on loses at most the judgment.
        self.state.advance()?;
        if let Err(e) = self.store.save(&self.state) {
            self.phase = TrialPhase::Faulted;
            return Err(e);
        }
        self.phase = TrialPhase::AwaitingResponse;
        Ok(())
    }

    fn play_with_gap(&mut self, samples: &[f32], rate: u32) -> Result<()> {
        self.sink.play(samples, rate)?;
        if !self.gap.is_zero() {
            std::thread::sleep(self.gap);
        }
        Ok(())
    }

    /// Record the judgment for the trial just heard, then run the next
    /// trial; reaching the end of the schedule completes the session.
    pub fn submit(&mut self, judgment: Judgment) -> Result<()> {
        if self.phase != TrialPhase::AwaitingResponse {
            return Err(Error::InvalidState(format!(
                "submit is not accepted in {:?}",
                self.phase
            )));
        }
        let (first, second) = self.current_pair.expect("pair set while awaiting response");
        let record = TrialRecord {
            participant: self.participant.clone(),
            trial: self.state.trial_counter(),
            first_stimulus: first + 1,
            second_stimulus: second + 1,
            judgment: judgment.value(),
        };
        if let Err(e) = self.store.append_result(&self.state, &record) {
            self.phase = TrialPhase::Faulted;
            return Err(e);
        }
        info!(
            trial = record.trial,
            judgment = record.judgment,
            "judgment recorded"
        );

        self.phase = TrialPhase::ReadyToStart;
        match self.start() {
            Ok(()) => Ok(()),
            Err(Error::SessionComplete { total }) => {
                info!(total, "session complete");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::decode;
    use crate::session::RESULTS_HEADER;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Sink that records every played buffer's marker sample and can fail a
    /// scripted number of times.
    #[derive(Debug)]
    struct ScriptedSink {
        played: Rc<RefCell<Vec<f32>>>,
        failures_left: u32,
    }

    impl ScriptedSink {
        fn new(played: Rc<RefCell<Vec<f32>>>) -> Self {
            Self {
                played,
                failures_left: 0,
            }
        }
    }

    impl AudioSink for ScriptedSink {
        fn play(&mut self, samples: &[f32], _sample_rate: u32) -> Result<()> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(Error::Playback("device unavailable".into()));
            }
            self.played.borrow_mut().push(samples[0]);
            Ok(())
        }
    }

    /// Variant i is a constant buffer of value i, so played markers identify
    /// stimuli.
    fn marked_set(n: usize) -> StimulusSet {
        StimulusSet::from_variants(
            (0..n).map(|i| vec![i as f32; 16]).collect(),
            48_000,
        )
    }

    fn setup(
        n: u32,
        pilot: bool,
        bank_size: usize,
    ) -> (tempfile::TempDir, SessionStore, SessionState, StimulusSet) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.csv"));
        let mut rng = rand::thread_rng();
        let state = store.initialize(n, pilot, dir.path(), &mut rng).unwrap();
        let set = marked_set(bank_size);
        (dir, store, state, set)
    }

    #[test]
    fn judgment_scale_is_enforced() {
        assert!(Judgment::new(-2).is_ok());
        assert!(Judgment::new(2).is_ok());
        assert!(matches!(
            Judgment::new(3),
            Err(Error::InvalidJudgment(3))
        ));
        assert_eq!("  -1 ".parse::<Judgment>().unwrap().value(), -1);
        assert!("x".parse::<Judgment>().is_err());
        assert!("5".parse::<Judgment>().is_err());
    }

    #[test]
    fn full_session_runs_to_complete() {
        let (_dir, store, state, set) = setup(2, false, 2);
        let played = Rc::new(RefCell::new(Vec::new()));
        let sink = ScriptedSink::new(played.clone());
        let mut ctl =
            TrialController::resume(&set, &store, state, "p01".into(), sink, Duration::ZERO)
                .unwrap();

        assert_eq!(ctl.phase(), TrialPhase::ReadyToStart);
        ctl.start().unwrap();
        assert_eq!(ctl.phase(), TrialPhase::AwaitingResponse);
        assert_eq!(ctl.state().trial_counter(), 1);

        // Two trials for n=2; second submit completes the session.
        ctl.submit(Judgment::new(2).unwrap()).unwrap();
        assert_eq!(ctl.phase(), TrialPhase::AwaitingResponse);
        ctl.submit(Judgment::new(-1).unwrap()).unwrap();
        assert_eq!(ctl.phase(), TrialPhase::Complete);

        // Four buffers played: A and B of both trials, no self-pairs.
        let markers = played.borrow();
        assert_eq!(markers.len(), 4);
        assert_ne!(markers[0], markers[1]);

        // No further events are accepted once complete.
        assert!(matches!(
            ctl.start().unwrap_err(),
            Error::InvalidState(_)
        ));
        assert!(matches!(
            ctl.submit(Judgment::new(0).unwrap()).unwrap_err(),
            Error::InvalidState(_)
        ));

        let txt = std::fs::read_to_string(ctl.state().results_file()).unwrap();
        let lines: Vec<&str> = txt.lines().collect();
        assert_eq!(lines[0], RESULTS_HEADER);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("p01,1,"));
        assert!(lines[1].ends_with(",2"));
        assert!(lines[2].starts_with("p01,2,"));
        assert!(lines[2].ends_with(",-1"));
    }

    #[test]
    fn submitted_pair_matches_the_schedule() {
        let (_dir, store, state, set) = setup(6, false, 6);
        let pairing = state.pairing().clone();
        let played = Rc::new(RefCell::new(Vec::new()));
        let sink = ScriptedSink::new(played.clone());
        let mut ctl =
            TrialController::resume(&set, &store, state, "p02".into(), sink, Duration::ZERO)
                .unwrap();
        ctl.start().unwrap();
        let (first, second) = decode(pairing.entries()[0], 6);
        assert_eq!(ctl.current_pair(), Some((first, second)));
        assert_eq!(played.borrow()[0], first as f32);
        assert_eq!(played.borrow()[1], second as f32);

        ctl.submit(Judgment::new(1).unwrap()).unwrap();
        let txt = std::fs::read_to_string(ctl.state().results_file()).unwrap();
        assert_eq!(
            txt.lines().nth(1).unwrap(),
            format!("p02,1,{},{},1", first + 1, second + 1)
        );
    }

    #[test]
    fn fifth_submit_records_trial_five_then_counter_is_six() {
        let (_dir, store, state, set) = setup(6, false, 6);
        let pairing = state.pairing().clone();
        let sink = ScriptedSink::new(Rc::new(RefCell::new(Vec::new())));
        let mut ctl =
            TrialController::resume(&set, &store, state, "p09".into(), sink, Duration::ZERO)
                .unwrap();
        ctl.start().unwrap();
        for _ in 0..4 {
            ctl.submit(Judgment::new(0).unwrap()).unwrap();
        }
        assert_eq!(ctl.state().trial_counter(), 5);
        ctl.submit(Judgment::new(2).unwrap()).unwrap();
        assert_eq!(ctl.state().trial_counter(), 6);

        let (first, second) = decode(pairing.entries()[4], 6);
        let txt = std::fs::read_to_string(ctl.state().results_file()).unwrap();
        assert_eq!(
            txt.lines().nth(5).unwrap(),
            format!("p09,5,{},{},2", first + 1, second + 1)
        );
    }

    #[test]
    fn pilot_session_presents_the_spread_subset() {
        let (_dir, store, state, set) = setup(3, true, 6);
        let played = Rc::new(RefCell::new(Vec::new()));
        let sink = ScriptedSink::new(played.clone());
        let mut ctl =
            TrialController::resume(&set, &store, state, "p03".into(), sink, Duration::ZERO)
                .unwrap();
        ctl.start().unwrap();
        // Schedule over 3 stimuli gives 6 trials.
        for _ in 0..6 {
            ctl.submit(Judgment::new(0).unwrap()).unwrap();
        }
        assert_eq!(ctl.phase(), TrialPhase::Complete);
        for &m in played.borrow().iter() {
            assert!(m == 0.0 || m == 2.0 || m == 5.0, "unexpected stimulus {m}");
        }
    }

    #[test]
    fn playback_failure_holds_the_trial_for_retry() {
        let (_dir, store, state, set) = setup(2, false, 2);
        let played = Rc::new(RefCell::new(Vec::new()));
        let mut sink = ScriptedSink::new(played.clone());
        sink.failures_left = 1;
        let mut ctl =
            TrialController::resume(&set, &store, state, "p04".into(), sink, Duration::ZERO)
                .unwrap();

        assert!(matches!(ctl.start().unwrap_err(), Error::Playback(_)));
        assert_eq!(ctl.phase(), TrialPhase::Playing);
        // Counter not advanced, nothing persisted as presented.
        assert_eq!(ctl.state().trial_counter(), 0);
        assert_eq!(store.load().unwrap().trial_counter(), 0);

        // Retry re-presents the same trial from stimulus A.
        ctl.retry().unwrap();
        assert_eq!(ctl.phase(), TrialPhase::AwaitingResponse);
        assert_eq!(ctl.state().trial_counter(), 1);
        assert_eq!(played.borrow().len(), 2);
    }

    #[test]
    fn persistence_failure_faults_the_controller() {
        let (_dir, store, state, set) = setup(2, false, 2);
        let results = state.results_file().to_path_buf();
        let played = Rc::new(RefCell::new(Vec::new()));
        let sink = ScriptedSink::new(played);
        let mut ctl =
            TrialController::resume(&set, &store, state, "p05".into(), sink, Duration::ZERO)
                .unwrap();
        ctl.start().unwrap();

        std::fs::remove_file(&results).unwrap();
        assert!(matches!(
            ctl.submit(Judgment::new(0).unwrap()).unwrap_err(),
            Error::Persistence(_)
        ));
        assert_eq!(ctl.phase(), TrialPhase::Faulted);
        assert!(matches!(
            ctl.submit(Judgment::new(0).unwrap()).unwrap_err(),
            Error::InvalidState(_)
        ));
        assert!(matches!(
            ctl.start().unwrap_err(),
            Error::InvalidState(_)
        ));
    }

    #[test]
    fn resume_continues_after_restart() {
        let (_dir, store, state, set) = setup(2, false, 2);
        let pairing = state.pairing().clone();
        {
            let sink = ScriptedSink::new(Rc::new(RefCell::new(Vec::new())));
            let mut ctl =
                TrialController::resume(&set, &store, state, "p06".into(), sink, Duration::ZERO)
                    .unwrap();
            ctl.start().unwrap();
            // Process dies here: trial 1 was played but never judged.
        }
        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.trial_counter(), 1);
        let played = Rc::new(RefCell::new(Vec::new()));
        let sink = ScriptedSink::new(played.clone());
        let mut ctl =
            TrialController::resume(&set, &store, reloaded, "p06".into(), sink, Duration::ZERO)
                .unwrap();
        ctl.start().unwrap();
        // The resumed trial is schedule position 2.
        let (first, _) = decode(pairing.entries()[1], 2);
        assert_eq!(played.borrow()[0], first as f32);
        assert_eq!(ctl.state().trial_counter(), 2);
    }

    #[test]
    fn resume_of_finished_session_is_complete() {
        let (_dir, store, mut state, set) = setup(2, false, 2);
        state.advance().unwrap();
        state.advance().unwrap();
        store.save(&state).unwrap();
        let sink = ScriptedSink::new(Rc::new(RefCell::new(Vec::new())));
        let ctl = TrialController::resume(&set, &store, state, "p07".into(), sink, Duration::ZERO)
            .unwrap();
        assert_eq!(ctl.phase(), TrialPhase::Complete);
    }

    #[test]
    fn bank_mismatch_is_rejected() {
        let (_dir, store, state, _) = setup(6, false, 6);
        let small = marked_set(3);
        let sink = ScriptedSink::new(Rc::new(RefCell::new(Vec::new())));
        assert!(matches!(
            TrialController::resume(&small, &store, state, "p08".into(), sink, Duration::ZERO)
                .unwrap_err(),
            Error::InvalidState(_)
        ));
    }
}
