//! CLI entry point for planforge.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use planforge::backend::{self, Backend};
use planforge::cli::{Cli, Commands, OutputFormat};
use planforge::config::Config;
use planforge::diagnostics::{Severity, TracingSink};
use planforge::inference::{CompiledPlan, InferenceResult, InferenceSession, TensorNames};
use planforge::{store, Device, ForgeError, ModelGraph, PlanCompiler, Stage};

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let stage = err
                .downcast_ref::<ForgeError>()
                .map(ForgeError::stage)
                .unwrap_or(Stage::Config);
            eprintln!("[{}] {:#}", stage, err);
            ExitCode::from(stage.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_yaml_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };

    let severity = if cli.verbose > 0 {
        Severity::Info
    } else {
        config.diagnostics.severity
    };
    let sink = Arc::new(TracingSink::new(severity));

    match cli.command {
        Commands::Compile {
            graph,
            output,
            workspace,
            precision,
            batch,
            device,
        } => {
            let graph_path = graph.unwrap_or(config.model.graph_path);
            let plan_path = output.unwrap_or(config.model.plan_path);
            let mut compile = config.compile;
            if let Some(bytes) = workspace {
                compile.workspace_bytes = bytes;
            }
            if let Some(precision) = precision {
                compile.precision = precision;
            }
            if batch.is_some() {
                compile.batch_size = batch;
            }

            let backend = open_backend(device.as_deref().unwrap_or(&config.model.device))?;
            info!("Loading graph: {}", graph_path.display());
            let graph = ModelGraph::from_path(&graph_path)?;
            let bytes = PlanCompiler::new(backend.as_ref(), sink.as_ref()).compile(&graph, &compile)?;
            store::write_plan(&plan_path, &bytes)?;
            info!("Plan written to {}", plan_path.display());
        }

        Commands::Infer {
            plan,
            images,
            input_name,
            output_name,
            channel_order,
            sequential,
            format,
            device,
        } => {
            let plan_path = plan.unwrap_or(config.model.plan_path);
            let images: Vec<PathBuf> = if images.is_empty() {
                config.inference.images
            } else {
                images
            };
            if images.is_empty() {
                return Err(ForgeError::config("no input images given").into());
            }
            let names = TensorNames::new(
                input_name.unwrap_or(config.inference.input_name),
                output_name.unwrap_or(config.inference.output_name),
            );
            let order = channel_order
                .map(Into::into)
                .unwrap_or(config.inference.channel_order);
            let parallel = config.inference.parallel_preprocess && !sequential;

            let backend = open_backend(device.as_deref().unwrap_or(&config.model.device))?;
            info!("Loading plan: {}", plan_path.display());
            let bytes = store::read_plan(&plan_path)?;
            let mut session =
                InferenceSession::open(backend, sink, &bytes, &names, Some(images.len()))?;

            let mut batch = session.input_batch()?.with_channel_order(order);
            info!("Preprocessing {} images", images.len());
            batch.fill_all(&images, parallel)?;

            let result = session.run(&batch)?;
            info!(
                "Inference complete: output {:?} in {:.2}ms",
                result.output.shape(),
                result.latency_ms
            );
            session.teardown();

            print_result(&result, format)?;
        }

        Commands::Info { plan, device } => {
            let plan_path = plan.unwrap_or(config.model.plan_path);
            let backend = open_backend(device.as_deref().unwrap_or(&config.model.device))?;
            let plan = CompiledPlan::load_file(backend.as_ref(), &plan_path, sink.as_ref())?;

            println!("planforge v{}", env!("CARGO_PKG_VERSION"));
            println!("Plan: {} ({} bytes)", plan_path.display(), plan.size_bytes());
            println!("Device: {} ({} backend)", plan.device(), backend.name());
            println!();
            for line in plan.describe() {
                println!("{}", line);
            }
        }
    }

    Ok(())
}

fn open_backend(device: &str) -> Result<Arc<dyn Backend>> {
    let device: Device = device.parse()?;
    info!("Using device: {}", device);
    Ok(backend::for_device(&device)?)
}

fn print_result(result: &InferenceResult, format: OutputFormat) -> Result<()> {
    let output = &result.output;
    match format {
        OutputFormat::Lines => {
            for (i, value) in output.data.iter().enumerate() {
                println!("Output[{}] = {}", i, value);
            }
        }
        OutputFormat::Json | OutputFormat::Pretty => {
            let json = serde_json::json!({
                "name": output.name,
                "shape": output.shape(),
                "latency_ms": result.latency_ms,
                "data": output.data.iter().copied().collect::<Vec<f32>>(),
            });
            if format == OutputFormat::Pretty {
                println!("{}", serde_json::to_string_pretty(&json)?);
            } else {
                println!("{}", serde_json::to_string(&json)?);
            }
        }
    }
    Ok(())
}
