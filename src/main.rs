use fabr::*;

use std::path::PathBuf;

use clap::Parser;

/// Recover function boundaries and ABI information from lifted binaries
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Analyze a `.blocks-exported` file produced by the lifter
    FromLifted {
        /// Path to the exported basic-block file
        exported_blocks: PathBuf,
        /// Also recover per-register argument/return-value usage (ABI analysis) rather than only
        /// boundaries, branch types and clobbered registers
        #[clap(long)]
        abi: bool,
        /// Path to output file for the human-readable analysis dump
        #[clap(long)]
        output: Option<PathBuf>,
        /// Path to output file for the per-function clobbered-registers report
        #[clap(long)]
        clobbered: Option<PathBuf>,
        /// Path to output file for the serialized model (Function/FunctionEdge records)
        #[clap(long)]
        output_model: Option<PathBuf>,
        /// Path to output file for the block-annotation metadata records
        #[clap(long)]
        output_annotations: Option<PathBuf>,
        /// Output the recovered call graph as a GraphViz `.dot` file to the given path
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the analysis behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<config::CommandLineAnalysisConfig>,
    },
}

fn main() {
    let args = Args::parse();

    match args {
        Args::FromLifted {
            exported_blocks,
            abi,
            output,
            clobbered,
            output_model,
            output_annotations,
            debug_output_graphviz,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let _log_guard = slog_scope::set_global_logger(crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            config::AnalysisConfig::initialize(advanced_config);

            let program = loader::load_from(
                &std::fs::read_to_string(exported_blocks)
                    .expect("Blocks file could not be read"),
            );

            let summary = interprocedural::run_analysis(&program, abi);

            if let Some(path) = debug_output_graphviz {
                use std::io::Write;
                write!(
                    std::fs::File::create(path).unwrap(),
                    "{}",
                    callgraph_dot::generate_dot(&summary)
                )
                .unwrap();
            }

            let mut binary = model::Binary::default();
            model::commit_to_model(&summary, &program, &mut binary);

            if let Some(path) = output_model {
                use std::io::Write;
                write!(std::fs::File::create(path).unwrap(), "{}", binary.serialize()).unwrap();
            }

            if let Some(path) = output_annotations {
                use std::io::Write;
                let annotations = annotate::build(&summary, &program, abi);
                write!(
                    std::fs::File::create(path).unwrap(),
                    "{}",
                    annotations.serialize()
                )
                .unwrap();
            }

            if let Some(path) = clobbered {
                use std::io::Write;
                write!(
                    std::fs::File::create(path).unwrap(),
                    "{}",
                    summary.clobbered_report(&program)
                )
                .unwrap();
            }

            if let Some(path) = output {
                use std::io::Write;
                write!(
                    std::fs::File::create(path).unwrap(),
                    "{}",
                    summary.dump(&program)
                )
                .unwrap();
            } else {
                println!("{}", summary.dump(&program));
            }

            log::trace!("Done");
        }
    }
}
