//! Command-line interface for planforge.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::compiler::Precision;
use crate::inference::ChannelOrder;

/// Compile model graphs into execution plans and run them on images.
#[derive(Parser, Debug)]
#[command(name = "planforge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a YAML config file. Command-line flags override its values.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log more (-v: debug, -vv: trace). Also prints info-level backend
    /// diagnostics.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile a model graph into a serialized plan.
    Compile {
        /// Model graph (YAML or JSON).
        #[arg(short, long)]
        graph: Option<PathBuf>,

        /// Where to write the plan.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Working-memory budget in bytes.
        #[arg(short, long)]
        workspace: Option<usize>,

        /// Arithmetic precision (fp32, fp16).
        #[arg(short, long)]
        precision: Option<Precision>,

        /// Fix the deferred batch dimension.
        #[arg(short, long)]
        batch: Option<usize>,

        /// Device to build for (cpu, cuda:0, ...).
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Run a compiled plan on a batch of images.
    Infer {
        /// Compiled plan.
        #[arg(short, long)]
        plan: Option<PathBuf>,

        /// One image per batch slot.
        #[arg(short, long, num_args = 1..)]
        images: Vec<PathBuf>,

        /// Name of the plan's input tensor.
        #[arg(long)]
        input_name: Option<String>,

        /// Name of the plan's output tensor.
        #[arg(long)]
        output_name: Option<String>,

        /// Channel order of the input planes.
        #[arg(long, value_enum)]
        channel_order: Option<ChannelOrderArg>,

        /// Decode images one at a time.
        #[arg(long)]
        sequential: bool,

        /// Output format.
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Device to run on (cpu, cuda:0, ...).
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Print the tensors a compiled plan declares.
    Info {
        /// Compiled plan.
        #[arg(short, long)]
        plan: Option<PathBuf>,

        /// Device to load the plan on.
        #[arg(short, long)]
        device: Option<String>,
    },
}

/// How `infer` prints the output tensor.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Single-line JSON.
    Json,
    /// Indented JSON.
    Pretty,
    /// One `Output[i] = v` line per value.
    Lines,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrderArg {
    Bgr,
    Rgb,
}

impl From<ChannelOrderArg> for ChannelOrder {
    fn from(arg: ChannelOrderArg) -> Self {
        match arg {
            ChannelOrderArg::Bgr => ChannelOrder::Bgr,
            ChannelOrderArg::Rgb => ChannelOrder::Rgb,
        }
    }
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compile() {
        let cli = Cli::try_parse_from([
            "planforge",
            "compile",
            "--graph",
            "model.yaml",
            "--precision",
            "fp16",
            "--batch",
            "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Compile {
                graph,
                precision,
                batch,
                output,
                ..
            } => {
                assert_eq!(graph, Some(PathBuf::from("model.yaml")));
                assert_eq!(precision, Some(Precision::Fp16));
                assert_eq!(batch, Some(4));
                assert_eq!(output, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_infer() {
        let cli = Cli::try_parse_from([
            "planforge", "-vv", "infer", "--images", "a.jpg", "b.jpg", "--format", "lines",
            "--channel-order", "rgb",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Infer {
                images,
                format,
                channel_order,
                sequential,
                ..
            } => {
                assert_eq!(images.len(), 2);
                assert_eq!(format, OutputFormat::Lines);
                assert_eq!(channel_order.map(ChannelOrder::from), Some(ChannelOrder::Rgb));
                assert!(!sequential);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
