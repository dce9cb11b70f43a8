use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{ArgMatches, Command};
use log::info;

use wfs_reduce::associator::Associator;
use wfs_reduce::config::Config;
use wfs_reduce::frame::{Frame, FrameState};
use wfs_reduce::processor::Processor;
use wfs_reduce::refcat::{ReferenceCatalog, Tycho2Catalog, UCAC4Catalog};
use wfs_reduce::tnx::{fit_tnx, Basis, CrossTerm, MatchedSample, TnxFitConfig};

mod cmdline {
    use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};

    //fp add_config_arg
    pub fn add_config_arg(cmd: Command) -> Command {
        cmd.arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .required(true)
                .help("Path to the pipeline's TOML configuration file")
                .action(ArgAction::Set),
        )
    }
    pub fn config(matches: &ArgMatches) -> String {
        matches.get_one::<String>("config").unwrap().to_string()
    }

    //fp add_input_arg
    pub fn add_input_arg(cmd: Command) -> Command {
        cmd.arg(
            Arg::new("input")
                .long("input")
                .short('i')
                .required(true)
                .help("Directory of frames to submit, in filename order")
                .action(ArgAction::Set),
        )
    }
    pub fn input(matches: &ArgMatches) -> String {
        matches.get_one::<String>("input").unwrap().to_string()
    }

    //fp add_ra_dec_args
    pub fn add_ra_dec_args(cmd: Command) -> Command {
        cmd.arg(
            Arg::new("ra")
                .long("ra")
                .required(true)
                .help("Right ascension, degrees")
                .value_parser(value_parser!(f64))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("dec")
                .long("dec")
                .required(true)
                .help("Declination, degrees")
                .value_parser(value_parser!(f64))
                .action(ArgAction::Set),
        )
    }
    pub fn ra(matches: &ArgMatches) -> f64 {
        *matches.get_one::<f64>("ra").unwrap()
    }
    pub fn dec(matches: &ArgMatches) -> f64 {
        *matches.get_one::<f64>("dec").unwrap()
    }

    //fp add_radius_arg
    pub fn add_radius_arg(cmd: Command) -> Command {
        cmd.arg(
            Arg::new("radius")
                .long("radius")
                .short('r')
                .help("Search radius, arcminutes")
                .value_parser(value_parser!(f64))
                .action(ArgAction::Set),
        )
    }
    pub fn radius(matches: &ArgMatches) -> f64 {
        *matches.get_one::<f64>("radius").unwrap_or(&10.0)
    }

    //fp add_catalog_kind_arg
    pub fn add_catalog_kind_arg(cmd: Command) -> Command {
        cmd.arg(
            Arg::new("kind")
                .long("kind")
                .help("Catalog backend: ucac4 or tycho2")
                .default_value("ucac4")
                .action(ArgAction::Set),
        )
    }
    pub fn catalog_kind(matches: &ArgMatches) -> String {
        matches.get_one::<String>("kind").unwrap().to_string()
    }

    //fp add_catalog_path_arg
    pub fn add_catalog_path_arg(cmd: Command) -> Command {
        cmd.arg(
            Arg::new("path")
                .long("path")
                .required(true)
                .help("Catalog root directory (UCAC4) or file (Tycho2)")
                .action(ArgAction::Set),
        )
    }
    pub fn catalog_path(matches: &ArgMatches) -> String {
        matches.get_one::<String>("path").unwrap().to_string()
    }

    //fp add_samples_arg
    pub fn add_samples_arg(cmd: Command) -> Command {
        cmd.arg(
            Arg::new("samples")
                .long("samples")
                .short('s')
                .required(true)
                .help("Matched-pairs file: one 'x y ra_deg dec_deg' line per sample")
                .action(ArgAction::Set),
        )
    }
    pub fn samples(matches: &ArgMatches) -> String {
        matches.get_one::<String>("samples").unwrap().to_string()
    }

    //fp add_order_args
    pub fn add_order_args(cmd: Command) -> Command {
        cmd.arg(
            Arg::new("xorder")
                .long("xorder")
                .default_value("4")
                .value_parser(value_parser!(usize))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("yorder")
                .long("yorder")
                .default_value("4")
                .value_parser(value_parser!(usize))
                .action(ArgAction::Set),
        )
    }
    pub fn xorder(matches: &ArgMatches) -> usize {
        *matches.get_one::<usize>("xorder").unwrap()
    }
    pub fn yorder(matches: &ArgMatches) -> usize {
        *matches.get_one::<usize>("yorder").unwrap()
    }

    //fp add_box_args
    pub fn add_box_args(cmd: Command) -> Command {
        cmd.arg(
            Arg::new("xmax")
                .long("xmax")
                .default_value("1024")
                .value_parser(value_parser!(f64))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("ymax")
                .long("ymax")
                .default_value("1024")
                .value_parser(value_parser!(f64))
                .action(ArgAction::Set),
        )
    }
    pub fn xmax(matches: &ArgMatches) -> f64 {
        *matches.get_one::<f64>("xmax").unwrap()
    }
    pub fn ymax(matches: &ArgMatches) -> f64 {
        *matches.get_one::<f64>("ymax").unwrap()
    }
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let run_subcmd = Command::new("run").about("Drive frames from a directory through the reduction pipeline");
    let run_subcmd = cmdline::add_config_arg(run_subcmd);
    let run_subcmd = cmdline::add_input_arg(run_subcmd);

    let catalog_subcmd = Command::new("catalog").about("Run a standalone cone search against a reference catalog");
    let catalog_subcmd = cmdline::add_catalog_kind_arg(catalog_subcmd);
    let catalog_subcmd = cmdline::add_catalog_path_arg(catalog_subcmd);
    let catalog_subcmd = cmdline::add_ra_dec_args(catalog_subcmd);
    let catalog_subcmd = cmdline::add_radius_arg(catalog_subcmd);

    let fit_subcmd = Command::new("fit-tnx").about("Fit a TNX distortion model from a matched-pairs file");
    let fit_subcmd = cmdline::add_samples_arg(fit_subcmd);
    let fit_subcmd = cmdline::add_order_args(fit_subcmd);
    let fit_subcmd = cmdline::add_box_args(fit_subcmd);

    let cmd = Command::new("wfs-reduce")
        .about("Wide-field survey image reduction pipeline")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand(run_subcmd)
        .subcommand(catalog_subcmd)
        .subcommand(fit_subcmd)
        .subcommand_required(true);

    let matches = cmd.get_matches();
    match matches.subcommand() {
        Some(("run", sub_matches)) => run(sub_matches),
        Some(("catalog", sub_matches)) => catalog(sub_matches),
        Some(("fit-tnx", sub_matches)) => fit_tnx_cmd(sub_matches),
        _ => Err(anyhow!("no subcommand given")),
    }
}

//fp run
/// Submit every frame under `--input`, in filename order, to a [`Processor`]
/// and an [`Associator`], dispatching stages until the queue drains.
fn run(matches: &ArgMatches) -> Result<(), anyhow::Error> {
    let config_path: PathBuf = cmdline::config(matches).into();
    let input_dir: PathBuf = cmdline::input(matches).into();

    let config = Config::from_path(&config_path).context("loading configuration")?;
    let output_path = config.output.path.clone();
    let processor = Processor::new(config.clone(), Vec::new());

    let mut entries: Vec<PathBuf> = std::fs::read_dir(&input_dir)
        .with_context(|| format!("reading input directory {}", input_dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for (i, path) in entries.iter().enumerate() {
        let start = hifitime::Epoch::from_mjd_utc(60000.0 + i as f64 * 30.0 / 86400.0);
        let frame = Frame::new(
            path.clone(),
            "g0".into(),
            "u0".into(),
            "c0".into(),
            i as i64 + 1,
            2048,
            2048,
            start,
            30.0,
        );
        processor.submit(frame);
    }
    info!("submitted {} frames from {}", entries.len(), input_dir.display());

    let catalog: Option<Box<dyn ReferenceCatalog + Send>> = if config.photometry.enable {
        Some(Box::new(UCAC4Catalog::new(config.photometry.catalog_path.clone())))
    } else {
        None
    };
    let catalog_mutex = catalog.map(std::sync::Mutex::new);

    let mut associator = Associator::new(output_path.clone());
    let mut idle_rounds = 0;
    loop {
        let mut did_work = processor.dispatch_extraction();
        did_work |= processor.dispatch_astrometry();
        if let Some(cat) = &catalog_mutex {
            did_work |= processor.dispatch_match(cat);
        }

        for frame in processor.drain_completed() {
            if frame.state == FrameState::CalibratedOrMatched {
                for track in associator.ingest_frame(&frame) {
                    info!("finalized track {} with {} points", track.id, track.pts.len());
                }
            }
        }

        if did_work {
            idle_rounds = 0;
        } else {
            idle_rounds += 1;
            if idle_rounds > 3 {
                break;
            }
            processor.wait_for_work(Duration::from_millis(200));
        }
    }
    for track in associator.finalize_all_open() {
        info!("finalized track {} with {} points", track.id, track.pts.len());
    }
    Ok(())
}

//fp catalog
fn catalog(matches: &ArgMatches) -> Result<(), anyhow::Error> {
    let kind = cmdline::catalog_kind(matches);
    let path: PathBuf = cmdline::catalog_path(matches).into();
    let ra = cmdline::ra(matches);
    let dec = cmdline::dec(matches);
    let radius = cmdline::radius(matches);

    let stars = match kind.as_str() {
        "ucac4" => UCAC4Catalog::new(path).cone_search(ra, dec, radius)?,
        "tycho2" => Tycho2Catalog::new(path).cone_search(ra, dec, radius)?,
        other => return Err(anyhow!("unknown catalog kind {other:?}; expected ucac4 or tycho2")),
    };

    for s in &stars {
        println!("{:.6} {:.6} {:.2}", s.ra_deg, s.dec_deg, s.mag);
    }
    eprintln!("{} stars within {radius} arcmin", stars.len());
    Ok(())
}

//fp fit_tnx_cmd
fn fit_tnx_cmd(matches: &ArgMatches) -> Result<(), anyhow::Error> {
    let samples_path: PathBuf = cmdline::samples(matches).into();
    let text = std::fs::read_to_string(&samples_path)
        .with_context(|| format!("reading samples file {}", samples_path.display()))?;

    let mut samples = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 4 {
            continue;
        }
        samples.push(MatchedSample {
            x: cols[0].parse()?,
            y: cols[1].parse()?,
            ra_deg: cols[2].parse()?,
            dec_deg: cols[3].parse()?,
        });
    }
    if samples.is_empty() {
        return Err(anyhow!("no matched samples parsed from {}", samples_path.display()));
    }

    let cfg = TnxFitConfig {
        basis: Basis::Legendre,
        cross_term: CrossTerm::Half,
        xorder: cmdline::xorder(matches),
        yorder: cmdline::yorder(matches),
        xmin: 0.0,
        xmax: cmdline::xmax(matches),
        ymin: 0.0,
        ymax: cmdline::ymax(matches),
        ref_pixel: None,
    };
    let model = fit_tnx(&samples, &cfg)?;
    println!(
        "scale={:.4} arcsec/pix rotation={:.3} deg errfit={:.4} arcsec",
        model.scale_arcsec_per_pixel(),
        model.rotation_deg(),
        model.errfit_arcsec
    );
    Ok(())
}
