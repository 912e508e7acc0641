use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use recarve::formats;
use recarve::{
    CarveEngine, DiskReader, ImageReader, Options, Params, Phase, ScanStatus, SearchSpace,
    Session, DEFAULT_SECTOR_SIZE,
};

#[derive(Parser)]
#[command(name = "recarve", version, about = "Signature-based file carver for damaged disks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Carve recoverable files out of a disk image
    Carve {
        image: PathBuf,
        /// Directory for recovered files
        #[arg(short = 'd', long, default_value = "recup")]
        output: PathBuf,
        /// Carving block size in bytes (defaults to the sector size)
        #[arg(short, long)]
        blocksize: Option<u64>,
        /// Sector size of the medium
        #[arg(long, default_value_t = DEFAULT_SECTOR_SIZE)]
        sector_size: u32,
        /// Formats to enable, by extension (default: all built-ins)
        #[arg(short, long, num_args = 1..)]
        formats: Option<Vec<String>>,
        /// Skip finalization checks: no truncation, keep raw carves
        #[arg(long)]
        no_paranoid: bool,
        /// Skip ext2/ext3 indirect blocks inside carved files
        #[arg(long)]
        ext2: bool,
        /// Destination filesystem is FAT: cap files below 4 GiB
        #[arg(long)]
        fat: bool,
        /// Reclaim search-space metadata behind the cursor
        #[arg(long)]
        lowmem: bool,
        /// Session file for checkpoints (default: <output>/recarve.ses)
        #[arg(short, long)]
        session: Option<PathBuf>,
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
    },
    /// Resume an interrupted scan from its session file
    Resume {
        image:   PathBuf,
        session: PathBuf,
        /// Directory for recovered files
        #[arg(short = 'd', long, default_value = "recup")]
        output: PathBuf,
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
    },
    /// List the built-in formats
    Formats,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        // ── Carve ────────────────────────────────────────────────────────────
        Commands::Carve {
            image,
            output,
            blocksize,
            sector_size,
            formats,
            no_paranoid,
            ext2,
            fat,
            lowmem,
            session,
            verbose,
        } => {
            let mut disk = ImageReader::with_sector_size(&image, sector_size)?;
            let sector = u64::from(sector_size);
            let media = disk.size() / sector * sector;
            if media == 0 {
                return Err(format!("{} is smaller than one sector", image.display()).into());
            }
            let blocksize = blocksize.unwrap_or(sector);
            if blocksize < sector || blocksize % sector != 0 {
                return Err(format!("blocksize {blocksize} is not a multiple of the sector size").into());
            }

            let registry = formats::registry_with(formats.as_deref());
            let mut search = SearchSpace::new(0, media - 1);
            let mut params = Params::new(output.clone(), blocksize);
            if ext2 {
                params.phase = Phase::Ext2On;
            }
            params.fat_partition = fat;
            let options = Options { paranoid: !no_paranoid, lowmem, verbose };

            let session_path = session.unwrap_or_else(|| output.join("recarve.ses"));
            std::fs::create_dir_all(&output)?;
            run_scan(
                &mut disk,
                &registry,
                &mut search,
                params,
                options,
                session_path,
                Uuid::new_v4(),
            )
        }

        // ── Resume ───────────────────────────────────────────────────────────
        Commands::Resume { image, session, output, verbose } => {
            let saved = Session::load_from(&session)?;
            let when = chrono::DateTime::from_timestamp(saved.saved_at, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown time".into());
            println!(
                "Resuming session {} (saved {}, {} region(s) left)",
                saved.session_uuid,
                when,
                saved.intervals.len()
            );

            let mut disk = ImageReader::open(&image)?;
            let registry = formats::registry_with(Some(saved.enabled_formats.as_slice()));
            let mut search = saved.search_space();
            let mut params = Params::new(output.clone(), saved.blocksize);
            params.offset = saved.offset;
            params.pass = saved.pass;
            params.phase = saved.phase();
            let options = Options { verbose, ..Options::default() };

            std::fs::create_dir_all(&output)?;
            let stats = saved.stats.clone();
            let uuid = saved.session_uuid;
            run_scan_with_stats(
                &mut disk,
                &registry,
                &mut search,
                params,
                options,
                session,
                uuid,
                &stats,
            )
        }

        // ── Formats ──────────────────────────────────────────────────────────
        Commands::Formats => {
            let registry = formats::builtin_registry();
            println!("{:<8} {:>12}  Description", "Name", "Max size");
            for (_, format) in registry.iter() {
                let stat = format.stat();
                let max = if stat.max_filesize == 0 {
                    "unbounded".to_string()
                } else {
                    format!("{} B", stat.max_filesize)
                };
                println!("{:<8} {:>12}  {}", stat.extension, max, stat.description);
            }
            Ok(())
        }
    }
}

fn run_scan(
    disk: &mut ImageReader,
    registry: &recarve::FormatRegistry,
    search: &mut SearchSpace,
    params: Params,
    options: Options,
    session_path: PathBuf,
    session_uuid: Uuid,
) -> Result<(), Box<dyn std::error::Error>> {
    run_scan_with_stats(disk, registry, search, params, options, session_path, session_uuid, &[])
}

#[allow(clippy::too_many_arguments)]
fn run_scan_with_stats(
    disk: &mut ImageReader,
    registry: &recarve::FormatRegistry,
    search: &mut SearchSpace,
    params: Params,
    options: Options,
    session_path: PathBuf,
    session_uuid: Uuid,
    saved_stats: &[(String, u64)],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = CarveEngine::new(disk, registry, params, options);
    engine.restore_stats(saved_stats);
    install_signal_handlers(engine.stop_flag());

    let enabled = registry.names();
    let checkpoint_path = session_path.clone();
    let checkpoint_names = enabled.clone();
    engine.set_checkpoint(Box::new(move |space, params, stats| {
        Session::capture(session_uuid, space, params, stats, checkpoint_names.clone())
            .save_to(&checkpoint_path)
            .map_err(|e| io::Error::other(e))
    }));
    engine.set_progress(Box::new(|pos, total| {
        let pct = if total > 0 { pos as f64 / total as f64 * 100.0 } else { 100.0 };
        eprint!("\rscanning {pos:#x} / {total:#x} ({pct:5.1}%)  ");
    }));

    let status = engine.run(search);
    eprintln!();

    // Final snapshot so an aborted scan can resume where it stopped.
    let stats = engine.stats_named();
    Session::capture(session_uuid, search, &engine.params, &stats, enabled)
        .save_to(&session_path)?;

    print_report(&engine);
    match status {
        ScanStatus::Complete => Ok(()),
        ScanStatus::Stopped => {
            println!("Scan stopped; resume with: recarve resume <image> {}", session_path.display());
            Ok(())
        }
        ScanStatus::OutputDenied => Err("cannot create files in the output directory".into()),
        ScanStatus::OutputFull => {
            Err(format!("output filesystem is full; session saved to {}", session_path.display())
                .into())
        }
    }
}

fn print_report(engine: &CarveEngine<'_>) {
    let report = engine.report();
    if report.is_empty() {
        println!("No files recovered.");
        return;
    }
    println!("{:<36} {:>12} {:>12}  BLAKE3", "File", "Size", "Start");
    for f in report {
        let hash = if f.hash.len() >= 16 { &f.hash[..16] } else { f.hash.as_str() };
        println!("{:<36} {:>12} {:>12}  {}", f.path.display(), f.size, f.start, hash);
    }
    println!();
    for (name, count) in engine.stats_named() {
        if count > 0 {
            println!("  {name:<6} {count:>6} recovered");
        }
    }
}

#[cfg(unix)]
fn install_signal_handlers(flag: Arc<AtomicBool>) {
    use std::sync::atomic::Ordering;
    use std::sync::OnceLock;

    static STOP: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    let _ = STOP.set(flag);

    extern "C" fn raise_stop(_sig: libc::c_int) {
        if let Some(flag) = STOP.get() {
            flag.store(true, Ordering::Relaxed);
        }
    }

    unsafe {
        let handler = raise_stop as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGHUP, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers(_flag: Arc<AtomicBool>) {}
