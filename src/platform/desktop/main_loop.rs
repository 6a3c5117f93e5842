use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::{App, AppSettings, Arg, SubCommand};

use crate::{
    build_scene,
    floating_type_mod::FT,
    scene::{scene_input_package, ScenePiece},
    DeformableSolver, OutputPackage, SceneConfig, SolverHandle, SolverParams,
};

const CARGO_PKG_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const CARGO_PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

pub fn start() {
    let matches = App::new("Deformable Solver")
        .version(CARGO_PKG_VERSION)
        .author(CARGO_PKG_AUTHORS)
        .about(CARGO_PKG_DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run a scene headless with the given solver config")
                .arg(
                    Arg::with_name("SOLVER_CONFIG")
                        .help("Sets the solver parameters")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("SCENE_CONFIG")
                        .help("Scene setup")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::with_name("FRAMES")
                        .long("frames")
                        .short("n")
                        .takes_value(true)
                        .default_value("120")
                        .help("Number of frames to simulate"),
                )
                .arg(
                    Arg::with_name("OVERWRITE_CONFIG_FILE")
                        .long("overwrite-config-file")
                        .short("c")
                        .required(false)
                        .takes_value(true)
                        .help("Overwrite config"),
                )
                .arg(
                    Arg::with_name("STATISTICS_ENABLED")
                        .help("Track performance of individual steps")
                        .short("p")
                        .long("statistics-enabled")
                        .takes_value(false),
                )
                .arg(
                    Arg::with_name("STATISTICS_PATH")
                        .long("statistics-path")
                        .short("w")
                        .required(false)
                        .takes_value(true)
                        .help("Where to write statistics to"),
                ),
        )
        .get_matches();

    let level = match matches.occurrences_of("v") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env().filter_level(level).init();

    if let Some(run_matches) = matches.subcommand_matches("run") {
        if let Err(err) = run(run_matches) {
            log::error!("{}", err);
            std::process::exit(1);
        }
    } else {
        unreachable!()
    }
}

fn load_params(path: &str, overwrite_path: Option<&str>) -> Result<SolverParams, String> {
    let params_yaml = std::fs::read_to_string(path).map_err(|e| format!("failed reading parameter file: {}", e))?;
    let mut params_serde: serde_yaml::Value =
        serde_yaml::from_str(&params_yaml).map_err(|e| format!("failed parsing solver config file: {}", e))?;

    if let Some(overwrite_path) = overwrite_path {
        let overwrite_str =
            std::fs::read_to_string(overwrite_path).map_err(|e| format!("failed reading overwrite file: {}", e))?;
        let overwrite: HashMap<String, serde_yaml::Value> =
            serde_yaml::from_str(&overwrite_str).map_err(|e| format!("failed parsing overwrite file: {}", e))?;
        let mapping = params_serde
            .as_mapping_mut()
            .ok_or_else(|| "solver config is not a mapping".to_string())?;
        for (k, v) in overwrite.into_iter() {
            mapping.insert(serde_yaml::Value::String(k), v);
        }
    }

    serde_yaml::from_value(params_serde).map_err(|e| format!("failed to unpack SolverParams: {}", e))
}

fn run(run_matches: &clap::ArgMatches) -> Result<(), String> {
    let parameter_file = run_matches.value_of("SOLVER_CONFIG").ok_or("missing solver config")?;
    let mut params = load_params(parameter_file, run_matches.value_of("OVERWRITE_CONFIG_FILE"))?;
    params.counters_enabled |= run_matches.is_present("STATISTICS_ENABLED");
    log::info!("{:?}", params);

    let scene_file_path = run_matches.value_of("SCENE_CONFIG").ok_or("missing scene config")?;
    let scene_yaml = std::fs::read_to_string(scene_file_path).map_err(|e| format!("failed reading scene file: {}", e))?;
    let scene_config: SceneConfig =
        serde_yaml::from_str(&scene_yaml).map_err(|e| format!("failed parsing scene config file: {}", e))?;
    let pieces = build_scene(&scene_config).map_err(|e| e.to_string())?;

    let frames: u64 = run_matches
        .value_of("FRAMES")
        .unwrap_or("120")
        .parse()
        .map_err(|e| format!("invalid frame count: {}", e))?;
    let statistics_path_opt = run_matches.value_of("STATISTICS_PATH").map(String::from);

    let solver = DeformableSolver::new(params);
    let handle = solver.handle();
    for piece in &pieces {
        handle.add_proxy(piece.proxy.clone());
    }

    let done: Arc<Mutex<bool>> = Arc::new(Mutex::from(false));
    let solver_thread = {
        let done = done.clone();
        let pieces = pieces.clone();
        let frame_dt = scene_config.frame_dt;
        std::thread::spawn(move || {
            let result = solver_main(solver, &pieces, frames, frame_dt);
            if let Ok(mut done) = done.lock() {
                *done = true;
            }
            result
        })
    };

    loop {
        let finished = done.lock().map(|d| *d).unwrap_or(true);
        while let Some(output) = handle.pull_output_package() {
            print_summary(&output, &pieces);
        }
        if finished {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    let statistics = solver_thread
        .join()
        .map_err(|_| "solver thread panicked".to_string())??;
    if let Some(s) = statistics {
        print!("{}", s);
        if let Some(statistics_path) = statistics_path_opt {
            std::fs::write(statistics_path, s).map_err(|e| format!("failed writing statistics: {}", e))?;
        }
    }
    Ok(())
}

fn solver_main(
    mut solver: DeformableSolver,
    pieces: &[ScenePiece],
    frames: u64,
    frame_dt: FT,
) -> Result<Option<String>, String> {
    let handle: SolverHandle = solver.handle();

    for frame in 0..frames {
        // drive data for the end of this frame
        let time = (frame + 1) as FT * frame_dt;
        handle.push_input_package(scene_input_package(pieces, frame, time));
        solver.simulate(frame_dt).map_err(|e| e.to_string())?;
    }

    if solver.params().counters_enabled {
        Ok(Some(solver.statistics()))
    } else {
        Ok(None)
    }
}

fn print_summary(output: &OutputPackage, pieces: &[ScenePiece]) {
    for (k, piece) in pieces.iter().enumerate() {
        let positions = match output.get(piece.proxy.id()) {
            Some(buffer) => &buffer.positions,
            None => continue,
        };
        if positions.is_empty() {
            continue;
        }
        let centroid = positions.iter().sum::<crate::V3>() / positions.len() as FT;
        let lowest = positions.iter().map(|p| p.z).fold(FT::MAX, FT::min);
        println!(
            "frame {:>5} body {}: centroid ({:.4}, {:.4}, {:.4}), lowest z {:.4}",
            output.frame, k, centroid.x, centroid.y, centroid.z, lowest
        );
    }
}
