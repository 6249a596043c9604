#[macro_use] extern crate clap;

use clap::{App, ArgMatches};
use corral::{
    abort,
    archive::{build_archive, unpack_archive, ArchiveMetadata, ArchiveOptions},
    cache::ArchiveMode,
    container::JobFile,
    installer::{CommandInstaller, PackageInstaller},
    subprocess::{Signal, DEFAULT_KILL_TIMEOUT},
    volume::LvmPool,
    Config, Error, Job, Manifest, ManifestHash, Provisioner, Resource, RootCache,
};
use env_logger::{from_env, Env};
use std::{fs, path::Path, process, sync::Arc, thread, time::Duration};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

// sysexits.h EX_TEMPFAIL, for errors worth retrying later
const EXIT_RETRYABLE: i32 = 75;

fn main() {
    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let log_level = matches.value_of("log_level").unwrap_or("info");
    from_env(Env::default().default_filter_or(log_level)).init();

    match run(&matches) {
        Ok(code) => process::exit(code),
        Err(err) => {
            log::error!("{}", err);
            process::exit(if err.is_retryable() { EXIT_RETRYABLE } else { 0xFF });
        }
    }
}

fn run(matches: &ArgMatches) -> Result<i32, Error> {
    let mut config = match matches.value_of("config") {
        Some(path) => Config::load(Path::new(path))?,
        None => Config::new(),
    };
    if let Some(dir) = matches.value_of("base_dir") {
        config = config.base_dir(dir);
    }
    let installer: Arc<dyn PackageInstaller> = Arc::new(CommandInstaller::new(
        matches.value_of("installer").unwrap_or("corral-install"),
    ));

    match matches.subcommand() {
        ("run", Some(sub)) => run_worker(config, installer, sub),
        ("root", Some(sub)) => {
            let manifest = read_manifest(sub)?;
            let mut mode = config.archive_mode;
            if let Some(value) = sub.value_of("archive_mode") {
                mode = parse_archive_mode(value)?;
            }
            let cache = RootCache::new(&config.base_dir, installer.clone())
                .archive_mode(mode)
                .lock_timeout(config.lock_timeout_duration());
            let mut root = cache.get_root(&manifest)?;
            println!("{} {}", root.hash(), root.path().display());
            if sub.is_present("size") {
                println!("{}", installer.installed_size(&manifest.packages)?);
            }
            root.wait_archived()?;
            root.close()?;
            Ok(0)
        }
        ("archive", Some(sub)) => {
            let mut options = ArchiveOptions::new();
            for path in sub.values_of("exclude").into_iter().flatten() {
                options = options.exclude(path);
            }
            let metadata = build_archive(
                Path::new(sub.value_of("dir").unwrap_or(".")),
                Path::new(sub.value_of("dest").unwrap_or_default()),
                &options,
            )?;
            print_metadata(&metadata);
            Ok(0)
        }
        ("unpack", Some(sub)) => {
            let metadata = unpack_archive(
                Path::new(sub.value_of("archive").unwrap_or_default()),
                Path::new(sub.value_of("dir").unwrap_or_default()),
            )?;
            print_metadata(&metadata);
            Ok(0)
        }
        ("evict", Some(sub)) => {
            let hash: ManifestHash = sub.value_of("hash").unwrap_or_default().parse()?;
            let cache = RootCache::new(&config.base_dir, installer)
                .lock_timeout(config.lock_timeout_duration());
            if !cache.evict(&hash, sub.is_present("archive"))? {
                log::warn!("root {} was not cached", hash);
            }
            Ok(0)
        }
        _ => Ok(2),
    }
}

fn run_worker(config: Config, installer: Arc<dyn PackageInstaller>, sub: &ArgMatches) -> Result<i32, Error> {
    abort::install_handlers()?;
    let manifest = read_manifest(sub)?;
    let id = match sub.value_of("id") {
        Some(id) => id.to_string(),
        None => format!("{}", process::id()),
    };

    let mut job = Job::new(id, manifest);
    job.network = !sub.is_present("no_network");
    job.build_in_place = sub.is_present("in_place");
    if let Some(mib) = sub.value_of("scratch_mib") {
        job.scratch_size = mib
            .parse::<u64>()
            .ok()
            .and_then(|mib| mib.checked_mul(1024 * 1024))
            .ok_or_else(|| Error::InvalidConfig(format!("bad scratch size {:?}", mib)))?;
    }
    job.command = sub
        .values_of("command")
        .into_iter()
        .flatten()
        .map(|value| value.to_string())
        .collect();
    for value in sub.values_of("file").into_iter().flatten() {
        let mut parts = value.splitn(2, '=');
        let (path, host_file) = match (parts.next(), parts.next()) {
            (Some(path), Some(host_file)) => (path, host_file),
            _ => return Err(Error::InvalidConfig(format!("bad file mapping {:?}", value))),
        };
        job.files.push(JobFile {
            path: Path::new(path).to_path_buf(),
            contents: fs::read(host_file)?,
            mode: 0o644,
        });
    }

    let pool = Arc::new(LvmPool::new(config.volume_group.clone()));
    let provisioner = Provisioner::new(config, installer, pool)?;
    let mut worker = provisioner.start(&job)?;
    log::info!(
        "worker {} running as pid {}, root {}",
        worker.id(),
        worker.pid(),
        worker.root_hash()
    );

    let status = loop {
        if let Some(status) = worker.check()? {
            break status;
        }
        if abort::stop_requested() {
            log::warn!("stopping worker {}", worker.id());
            break worker.kill(Signal::SIGTERM, DEFAULT_KILL_TIMEOUT)?;
        }
        thread::sleep(POLL_INTERVAL);
    };
    log::info!("worker {} finished, {}", worker.id(), status);
    worker.close()?;
    Ok(status.as_raw_code())
}

fn read_manifest(sub: &ArgMatches) -> Result<Manifest, Error> {
    let path = sub.value_of("manifest").unwrap_or_default();
    let text = fs::read_to_string(path)?;
    if path.ends_with(".json") {
        Manifest::from_json(&text)
    } else {
        Manifest::parse_lines(&text)
    }
}

fn parse_archive_mode(value: &str) -> Result<ArchiveMode, Error> {
    match value {
        "disabled" => Ok(ArchiveMode::Disabled),
        "inline" => Ok(ArchiveMode::Inline),
        "background" => Ok(ArchiveMode::Background),
        other => Err(Error::InvalidConfig(format!("unknown archive mode {:?}", other))),
    }
}

fn print_metadata(metadata: &ArchiveMetadata) {
    print!("{}", metadata);
}
