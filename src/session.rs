use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::info;

use crate::error::{Error, Result};
use crate::pairing::PairingSequence;

/// Column layout of the session file. The header doubles as the format
/// version: a file with any other header is rejected on load.
const SESSION_HEADER: &str = "Kk,Ns,Cnt,csvFN,Pilot";

/// Header of the results CSV, one row appended per completed trial.
pub const RESULTS_HEADER: &str = "Participant,Trial,First Stimulus,Second Stimulus,Result";

/// One completed trial. Stimulus numbers are written 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialRecord {
    pub participant: String,
    pub trial: u32,
    pub first_stimulus: u32,
    pub second_stimulus: u32,
    pub judgment: i8,
}

/// Persisted session record: the schedule, how far the session has
/// progressed, and where results accumulate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pairing: PairingSequence,
    trial_counter: u32,
    results_file: PathBuf,
    pilot: bool,
}

impl SessionState {
    pub fn pairing(&self) -> &PairingSequence {
        &self.pairing
    }

    /// Number of trials started so far. At `AwaitingResponse` this is the
    /// 1-based index of the trial whose judgment is pending.
    pub fn trial_counter(&self) -> u32 {
        self.trial_counter
    }

    pub fn results_file(&self) -> &Path {
        &self.results_file
    }

    pub fn pilot(&self) -> bool {
        self.pilot
    }

    pub fn total_trials(&self) -> usize {
        self.pairing.len()
    }

    pub fn is_complete(&self) -> bool {
        self.trial_counter as usize >= self.pairing.len()
    }

    /// Move to the next trial. Terminal signal once the schedule is
    /// exhausted.
    pub fn advance(&mut self) -> Result<()> {
        if self.is_complete() {
            return Err(Error::SessionComplete {
                total: self.pairing.len(),
            });
        }
        self.trial_counter += 1;
        Ok(())
    }
}

/// Owns the session file path and all reads/writes of session and results
/// files.
#[derive(Debug)]
pub struct SessionStore {
    session_path: PathBuf,
}

impl SessionStore {
    pub fn new(session_path: impl Into<PathBuf>) -> Self {
        Self {
            session_path: session_path.into(),
        }
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    /// Start a fresh session: draw the pairing sequence, create a
    /// header-only results file named after the current time, and persist
    /// the state, unconditionally overwriting any previous session.
    pub fn initialize<R: Rng>(
        &self,
        stimulus_count: u32,
        pilot: bool,
        results_dir: &Path,
        rng: &mut R,
    ) -> Result<SessionState> {
        let pairing = PairingSequence::schedule(stimulus_count, rng);
        let stamp = chrono::Local::now().format("%m%d%H%M");
        let results_file = results_dir.join(format!("SQResult-{stamp}.csv"));
        fs::write(&results_file, format!("{RESULTS_HEADER}\n"))
            .map_err(|e| Error::Persistence(format!("{}: {e}", results_file.display())))?;
        let state = SessionState {
            pairing,
            trial_counter: 0,
            results_file,
            pilot,
        };
        self.save(&state)?;
        info!(
            trials = state.total_trials(),
            stimulus_count,
            pilot,
            results = %state.results_file.display(),
            "session initialized"
        );
        Ok(state)
    }

    /// Load the persisted session. Missing file means no session was ever
    /// initialized.
    pub fn load(&self) -> Result<SessionState> {
        let txt = match fs::read_to_string(&self.session_path) {
            Ok(txt) => txt,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NoActiveSession)
            }
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "{}: {e}",
                    self.session_path.display()
                )))
            }
        };
        parse_session(&txt)
            .map_err(|msg| Error::Persistence(format!("{}: {msg}", self.session_path.display())))
    }

    /// Write-then-rename so a crash mid-write cannot leave a truncated
    /// session file.
    pub fn save(&self, state: &SessionState) -> Result<()> {
        let tmp = self.session_path.with_extension("csv.tmp");
        fs::write(&tmp, render_session(state))
            .map_err(|e| Error::Persistence(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.session_path)
            .map_err(|e| Error::Persistence(format!("{}: {e}", self.session_path.display())))?;
        Ok(())
    }

    /// Append one completed trial to the results file.
    pub fn append_result(&self, state: &SessionState, record: &TrialRecord) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(state.results_file())
            .map_err(|e| {
                Error::Persistence(format!("{}: {e}", state.results_file().display()))
            })?;
        writeln!(
            file,
            "{},{},{},{},{}",
            record.participant,
            record.trial,
            record.first_stimulus,
            record.second_stimulus,
            record.judgment
        )
        .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }
}

fn render_session(state: &SessionState) -> String {
    let mut out = String::new();
    out.push_str(SESSION_HEADER);
    out.push('\n');
    for (i, &k) in state.pairing.entries().iter().enumerate() {
        if i == 0 {
            out.push_str(&format!(
                "{},{},{},{},{}\n",
                k,
                state.pairing.stimulus_count(),
                state.trial_counter,
                state.results_file.display(),
                u8::from(state.pilot),
            ));
        } else {
            out.push_str(&format!("{k},,,,\n"));
        }
    }
    out
}

fn parse_session(txt: &str) -> std::result::Result<SessionState, String> {
    let mut lines = txt.lines();
    let header = lines.next().ok_or("empty session file")?;
    if header != SESSION_HEADER {
        return Err(format!(
            "unrecognized session header {header:?} (expected {SESSION_HEADER:?})"
        ));
    }
    let mut entries = Vec::new();
    let mut meta: Option<(u32, u32, PathBuf, bool)> = None;
    for (row, line) in lines.enumerate() {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        let k: u32 = fields[0]
            .parse()
            .map_err(|_| format!("row {row}: bad pairing entry {:?}", fields[0]))?;
        entries.push(k);
        if row == 0 {
            if fields.len() != 5 {
                return Err(format!("row 0: expected 5 fields, got {}", fields.len()));
            }
            let ns: u32 = fields[1]
                .parse()
                .map_err(|_| format!("bad stimulus count {:?}", fields[1]))?;
            let cnt: u32 = fields[2]
                .parse()
                .map_err(|_| format!("bad trial counter {:?}", fields[2]))?;
            let pilot = match fields[4] {
                "0" => false,
                "1" => true,
                other => return Err(format!("bad pilot flag {other:?}")),
            };
            meta = Some((ns, cnt, PathBuf::from(fields[3]), pilot));
        }
    }
    let (ns, cnt, results_file, pilot) = meta.ok_or("session file has no data rows")?;
    if cnt as usize > entries.len() {
        return Err(format!(
            "trial counter {cnt} exceeds sequence length {}",
            entries.len()
        ));
    }
    Ok(SessionState {
        pairing: PairingSequence::from_entries(entries, ns),
        trial_counter: cnt,
        results_file,
        pilot,
    })
}
