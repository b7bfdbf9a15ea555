// Command line utility for running the sc-pipeline stages

use anyhow::{Context, Error};
use clap::{value_parser, Arg, ArgAction, Command};
use log::info;
use sc_pipeline::{Pipeline, PipelineConfig};
use std::fs::create_dir_all;
use std::path::PathBuf;

fn command() -> Command {
    Command::new("sc-pipeline-cmd")
        .about("Cluster the cells of a tab-delimited gene x cell count matrix")
        .arg(
            Arg::new("INPUT")
                .help("count matrix (.tsv or .tsv.gz)")
                .required(true)
                .index(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("OUT_DIR")
                .help("Output directory")
                .short('o')
                .long("out_dir")
                .default_value(".")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("CONFIG")
                .help("JSON configuration; unset fields take their defaults")
                .short('c')
                .long("config")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("SEED")
                .help("Seed of every stochastic stage")
                .long("seed")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("NUM_PCS")
                .help("Number of PCA components to compute")
                .short('d')
                .long("num_pcs")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("NEIGHBORS")
                .help("Neighbors per cell")
                .short('k')
                .long("neighbors")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("RESOLUTION")
                .help("Louvain resolution")
                .short('r')
                .long("resolution")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("GROUP")
                .help("Write the normalized matrix of this group; repeatable")
                .short('g')
                .long("group")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("NO_TSNE")
                .help("Skip the t-SNE layout")
                .long("no_tsne")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("NO_DOUBLETS")
                .help("Skip doublet detection")
                .long("no_doublets")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("PRINT_CONFIG")
                .help("Print the effective configuration as JSON and exit")
                .long("print_config")
                .action(ArgAction::SetTrue),
        )
}

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let matches = command().get_matches();

    let mut config = match matches.get_one::<PathBuf>("CONFIG") {
        Some(path) => PipelineConfig::from_json_file(path).with_context(|| path.display().to_string())?,
        None => PipelineConfig::default(),
    };
    if let Some(&seed) = matches.get_one::<u64>("SEED") {
        config.set_seed(seed);
    }
    if let Some(&num_pcs) = matches.get_one::<usize>("NUM_PCS") {
        config.pca.num_components = num_pcs;
    }
    if let Some(&k) = matches.get_one::<usize>("NEIGHBORS") {
        config.neighbors.k = Some(k);
    }
    if let Some(&resolution) = matches.get_one::<f64>("RESOLUTION") {
        config.clustering.resolution = resolution;
    }
    if let Some(groups) = matches.get_many::<String>("GROUP") {
        config.groups_of_interest = groups.cloned().collect();
    }
    if matches.get_flag("NO_TSNE") {
        config.tsne.enabled = false;
    }
    if matches.get_flag("NO_DOUBLETS") {
        config.doublets.enabled = false;
    }
    if matches.get_flag("PRINT_CONFIG") {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let input: &PathBuf = matches.get_one("INPUT").context("missing INPUT")?;
    let out_dir: &PathBuf = matches.get_one("OUT_DIR").context("missing OUT_DIR")?;
    create_dir_all(out_dir).with_context(|| out_dir.display().to_string())?;

    let matrix = sc_pipeline::io::read_matrix(input)?;
    let groups = config.groups_of_interest.clone();
    let result = Pipeline::new(config)?.run(&matrix)?;
    for d in &result.diagnostics {
        info!("diagnostic: {}", d);
    }
    if result.low_confidence {
        info!("the run finished with low-confidence diagnostics");
    }
    result.write_outputs(out_dir, &groups)?;
    Ok(())
}
