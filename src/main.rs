use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{LevelFilter, error, info};

use cycler_pipeline::cli::parse;
use cycler_pipeline::config::RunConfig;
use cycler_pipeline::pipelines::consensus_assembly;
use cycler_pipeline::utils::command::{ProcessRunner, ToolRunner};
use cycler_pipeline::utils::system::log_host_resources;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n Cycler Pipeline\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let run_config = match RunConfig::resolve(&args, &dir) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Input: {}; output: {}; read type: {}; assemblers: {}",
        run_config.in_dir.display(),
        run_config.out_dir.display(),
        run_config.read_type,
        run_config.assemblers.join(",")
    );
    log_host_resources(run_config.threads);

    let runner: Arc<dyn ToolRunner> = Arc::new(ProcessRunner::new(run_config.retries));
    let pipeline = consensus_assembly::build(run_config, runner);

    let summary = match pipeline.run().await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    };

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    let code = summary.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
