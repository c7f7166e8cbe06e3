use std::error::Error as StdError;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};

use sqlab::audio_io::CpalSink;
use sqlab::dsp::spectrum::amplitude_spectrum;
use sqlab::error::Error;
use sqlab::stimulus::{self, StimulusBank};
use sqlab::{ExperimentConfig, Judgment, SessionStore, TrialController, TrialPhase};

/// Paired-comparison listening experiment runner
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the experiment configuration
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a fresh session (overwrites any previous one)
    Init(InitArgs),
    /// Run or resume the active session
    Run(RunArgs),
    /// Build the stimulus bank and export each variant as a WAV file
    Render(RenderArgs),
    /// Write the amplitude spectrum of a WAV file as CSV
    Spectrum(SpectrumArgs),
    /// Generate a default config file and exit
    GenerateConfig(ConfigArgs),
}

#[derive(ClapArgs)]
struct InitArgs {
    /// Schedule a pilot run over the reduced stimulus subset
    #[arg(long, default_value_t = false)]
    pilot: bool,
}

#[derive(ClapArgs)]
struct RunArgs {
    /// Participant identifier written to every result row
    #[arg(long)]
    participant: String,
}

#[derive(ClapArgs)]
struct RenderArgs {
    /// Directory the stimulus WAV files are written to
    #[arg(long, default_value = ".")]
    out: PathBuf,
}

#[derive(ClapArgs)]
struct SpectrumArgs {
    /// WAV file to analyze
    #[arg(long)]
    input: PathBuf,
    /// Output CSV path
    #[arg(long, default_value = "spectrum.csv")]
    out: PathBuf,
}

#[derive(ClapArgs)]
struct ConfigArgs {
    /// Output path for the generated configuration
    #[arg(long, default_value = "config.toml")]
    out: String,
}

fn main() -> Result<(), Box<dyn StdError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sqlab=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => init_command(&cli.config, args)?,
        Commands::Run(args) => run_command(&cli.config, args)?,
        Commands::Render(args) => render_command(&cli.config, args)?,
        Commands::Spectrum(args) => spectrum_command(args)?,
        Commands::GenerateConfig(cfg) => {
            ExperimentConfig::generate_default(std::path::Path::new(&cfg.out))?;
            println!("Generated default config at {}", cfg.out);
        }
    }
    Ok(())
}

fn init_command(config_path: &std::path::Path, args: InitArgs) -> Result<(), Box<dyn StdError>> {
    let config = ExperimentConfig::load(config_path)?;
    let n = if args.pilot {
        config.pilot_count
    } else {
        config.stimulus_count()
    };
    let store = SessionStore::new(&config.session_file);
    let mut rng = rand::thread_rng();
    let state = store.initialize(n, args.pilot, &config.results_dir, &mut rng)?;
    println!(
        "Session initialized: {} trials over {} stimuli{}",
        state.total_trials(),
        n,
        if args.pilot { " (pilot)" } else { "" }
    );
    println!("Results file: {}", state.results_file().display());
    Ok(())
}

fn run_command(config_path: &std::path::Path, args: RunArgs) -> Result<(), Box<dyn StdError>> {
    if args.participant.contains(',') {
        return Err(Box::new(Error::Config(
            "participant id must not contain commas".into(),
        )));
    }
    let config = ExperimentConfig::load(config_path)?;
    let source = stimulus::load_source(&config.source_file)?;
    let set = StimulusBank::build(
        &source,
        &config.stimuli,
        config.target_peak,
        config.taper_ms,
    )?;

    let store = SessionStore::new(&config.session_file);
    let state = store.load()?;
    let sink = CpalSink::open_default()?;
    let gap = Duration::from_secs_f64(config.gap_secs);
    let mut ctl = TrialController::resume(&set, &store, state, args.participant, sink, gap)?;

    if ctl.phase() == TrialPhase::Complete {
        println!("Session already complete.");
        return Ok(());
    }

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    println!(
        "Resuming at trial {}/{}. Press Enter to start.",
        ctl.state().trial_counter() + 1,
        ctl.state().total_trials()
    );
    let _ = lines.next();
    start_with_retry(&mut ctl, &mut lines)?;

    while ctl.phase() == TrialPhase::AwaitingResponse {
        let judgment = prompt_judgment(&mut ctl, &mut lines)?;
        match ctl.submit(judgment) {
            Ok(()) => {}
            Err(Error::Playback(msg)) => {
                eprintln!("Playback failed: {msg}");
                retry_loop(&mut ctl, &mut lines)?;
            }
            Err(e) => return Err(Box::new(e)),
        }
    }

    if ctl.phase() == TrialPhase::Complete {
        println!(
            "Session complete: all {} trials recorded.",
            ctl.state().total_trials()
        );
    }
    Ok(())
}

fn stdin_closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "stdin closed")
}

fn start_with_retry<S: sqlab::AudioSink>(
    ctl: &mut TrialController<S>,
    lines: &mut impl Iterator<Item = std::io::Result<String>>,
) -> Result<(), Box<dyn StdError>> {
    match ctl.start() {
        Ok(()) => Ok(()),
        Err(Error::Playback(msg)) => {
            eprintln!("Playback failed: {msg}");
            retry_loop(ctl, lines)
        }
        Err(e) => Err(Box::new(e)),
    }
}

fn retry_loop<S: sqlab::AudioSink>(
    ctl: &mut TrialController<S>,
    lines: &mut impl Iterator<Item = std::io::Result<String>>,
) -> Result<(), Box<dyn StdError>> {
    while ctl.phase() == TrialPhase::Playing {
        print!("Press Enter to retry this trial, or q to abort: ");
        std::io::stdout().flush()?;
        match lines.next() {
            Some(Ok(line)) if line.trim() == "q" => {
                return Err(Box::new(Error::Playback("aborted by operator".into())))
            }
            Some(Ok(_)) => match ctl.retry() {
                Ok(()) => {}
                Err(Error::Playback(msg)) => eprintln!("Playback failed again: {msg}"),
                Err(e) => return Err(Box::new(e)),
            },
            _ => return Err(Box::new(stdin_closed())),
        }
    }
    Ok(())
}

fn prompt_judgment<S: sqlab::AudioSink>(
    ctl: &TrialController<S>,
    lines: &mut impl Iterator<Item = std::io::Result<String>>,
) -> Result<Judgment, Box<dyn StdError>> {
    let (first, second) = ctl.current_pair().expect("awaiting response implies a pair");
    println!(
        "{}/{}: stimulus {} (A) vs stimulus {} (B)",
        ctl.state().trial_counter(),
        ctl.state().total_trials(),
        first + 1,
        second + 1
    );
    println!("Compared to B, the quality of A is:");
    println!("  2 = A better   1 = A slightly better   0 = no preference");
    println!(" -1 = B slightly better  -2 = B better");
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        match lines.next() {
            Some(Ok(line)) => match line.parse::<Judgment>() {
                Ok(j) => return Ok(j),
                Err(_) => eprintln!("Enter a whole number from -2 to 2."),
            },
            _ => return Err(Box::new(stdin_closed())),
        }
    }
}

fn render_command(config_path: &std::path::Path, args: RenderArgs) -> Result<(), Box<dyn StdError>> {
    let config = ExperimentConfig::load(config_path)?;
    let source = stimulus::load_source(&config.source_file)?;
    let set = StimulusBank::build(
        &source,
        &config.stimuli,
        config.target_peak,
        config.taper_ms,
    )?;
    std::fs::create_dir_all(&args.out)?;
    stimulus::export_wav(&set, &args.out)?;
    println!("Exported {} stimuli to {}", set.len(), args.out.display());
    Ok(())
}

fn spectrum_command(args: SpectrumArgs) -> Result<(), Box<dyn StdError>> {
    let mut reader = hound::WavReader::open(&args.input)?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .step_by(channels)
            .collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .step_by(channels)
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let sp = amplitude_spectrum(&samples, spec.sample_rate);
    let mut out = String::from("Frequency,Level\n");
    for (f, l) in sp.freqs_hz.iter().zip(&sp.level_db) {
        out.push_str(&format!("{f},{l}\n"));
    }
    std::fs::write(&args.out, out)?;
    println!(
        "Wrote spectrum of {} ({} bins) to {}",
        args.input.display(),
        sp.freqs_hz.len(),
        args.out.display()
    );
    Ok(())
}
