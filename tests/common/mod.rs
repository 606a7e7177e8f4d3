#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use tempfile::TempDir;

use cycler_pipeline::config::RunConfig;
use cycler_pipeline::config::defs::PipelineError;
use cycler_pipeline::pipelines::consensus_assembly;
use cycler_pipeline::pipelines::driver::Pipeline;
use cycler_pipeline::utils::command::{ProcessRunner, ToolInvocation, ToolOutput, ToolRunner};

pub const CONSENSUS_BODY: &str = ">consensus\nACGTACGTACGT\n";
pub const POLISHED_BODY: &str = ">polished\nACGTACGTACGA\n";

/// Stands in for every external tool: records each call and writes the files the
/// real program would have written.
pub struct SimulatedTools {
    calls: Mutex<Vec<ToolInvocation>>,
    pub genome_size_stdout: Option<String>,
    /// QC-passing clusters per sample id; samples not listed get two.
    pub clusters: HashMap<String, usize>,
    /// (program, substring of the command line) pairs that make a call fail.
    pub failures: Vec<(&'static str, String)>,
    /// Programs, subcommands, or assemblers that exit 0 without writing anything.
    pub silent: HashSet<String>,
    pub missing: HashSet<String>,
}

impl SimulatedTools {
    pub fn new() -> Self {
        SimulatedTools {
            calls: Mutex::new(Vec::new()),
            genome_size_stdout: Some("4200000\n".to_string()),
            clusters: HashMap::new(),
            failures: Vec::new(),
            silent: HashSet::new(),
            missing: HashSet::new(),
        }
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls of `program` whose first argument is `first_arg`.
    pub fn calls_of(&self, program: &str, first_arg: Option<&str>) -> Vec<ToolInvocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .filter(|c| first_arg.is_none_or(|a| c.args.first().map(String::as_str) == Some(a)))
            .collect()
    }

    fn simulate(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PipelineError> {
        let line = invocation.command_line();
        if self
            .failures
            .iter()
            .any(|(program, needle)| invocation.program == *program && line.contains(needle.as_str()))
        {
            return Err(PipelineError::ToolExecution {
                tool: invocation.program.clone(),
                error: "exit status: 1; stderr: simulated failure".to_string(),
            });
        }

        let args = &invocation.args;
        let first = args.first().map(String::as_str).unwrap_or("");
        let silent = self.silent.contains(&invocation.program)
            || self.silent.contains(first)
            || (first == "helper" && args.get(1).is_some_and(|a| self.silent.contains(a)));
        if silent {
            return Ok(ToolOutput::default());
        }

        let mut stdout = String::new();
        match (invocation.program.as_str(), first) {
            ("autocycler", "helper") if args.get(1).map(String::as_str) == Some("genome_size") => {
                match &self.genome_size_stdout {
                    Some(text) => stdout = text.clone(),
                    None => {
                        return Err(PipelineError::ToolExecution {
                            tool: "autocycler".to_string(),
                            error: "exit status: 1; stderr: estimation crashed".to_string(),
                        });
                    }
                }
            }
            ("autocycler", "helper") => {
                let prefix = flag(args, "--out_prefix").expect("assembler prefix");
                write(&PathBuf::from(format!("{}.fasta", prefix.display())), ">contig_1\nACGT\n");
            }
            ("autocycler", "subsample") => {
                let dir = flag(args, "--out_dir").expect("subsample dir");
                let count: usize = flag(args, "--count")
                    .and_then(|c| c.to_string_lossy().parse().ok())
                    .expect("subsample count");
                for n in 1..=count {
                    write(&dir.join(format!("sample_{:02}.fastq", n)), "@r\nACGT\n+\nIIII\n");
                }
            }
            ("autocycler", "compress") => {
                let dir = flag(args, "-a").expect("autocycler dir");
                write(&dir.join("input_assemblies.gfa"), "H\tVN:Z:1.0\n");
            }
            ("autocycler", "cluster") => {
                let dir = flag(args, "-a").expect("autocycler dir");
                let id = dir.file_name().unwrap().to_string_lossy().into_owned();
                let clustering = dir.join("clustering");
                write(&clustering.join("clustering.tsv"), "node\tcluster\n");
                fs::create_dir_all(clustering.join("qc_pass")).unwrap();
                let count = self.clusters.get(&id).copied().unwrap_or(2);
                for n in 1..=count {
                    write(
                        &clustering.join("qc_pass").join(format!("cluster_{:03}", n)).join("1_untrimmed.gfa"),
                        "H\tVN:Z:1.0\n",
                    );
                }
            }
            ("autocycler", "trim") => {
                let dir = flag(args, "-c").expect("cluster dir");
                write(&dir.join("2_trimmed.gfa"), "H\tVN:Z:1.0\n");
            }
            ("autocycler", "resolve") => {
                let dir = flag(args, "-c").expect("cluster dir");
                write(&dir.join("5_final.gfa"), "H\tVN:Z:1.0\n");
            }
            ("autocycler", "combine") => {
                let dir = flag(args, "-a").expect("autocycler dir");
                write(&dir.join("consensus_assembly.gfa"), "H\tVN:Z:1.0\n");
                write(&dir.join("consensus_assembly.fasta"), CONSENSUS_BODY);
            }
            ("checkm2", "predict") => {
                let dir = flag(args, "-o").expect("checkm2 out dir");
                write(&dir.join("quality_report.tsv"), "Name\tCompleteness\tContamination\n");
            }
            ("racon", _) => stdout = POLISHED_BODY.to_string(),
            ("minimap2", _) => stdout = "@HD\tVN:1.6\n".to_string(),
            _ => stdout = "@r\nACGT\n+\nIIII\n".to_string(),
        }

        if let Some(path) = &invocation.stdout_to {
            write(path, &stdout);
            stdout.clear();
        }
        Ok(ToolOutput { stdout })
    }
}

impl ToolRunner for SimulatedTools {
    fn run<'a>(&'a self, invocation: &'a ToolInvocation) -> BoxFuture<'a, Result<ToolOutput, PipelineError>> {
        async move {
            self.calls.lock().unwrap().push(invocation.clone());
            self.simulate(invocation)
        }
        .boxed()
    }

    fn locate(&self, program: &str) -> Result<PathBuf, PipelineError> {
        if self.missing.contains(program) {
            Err(PipelineError::ToolUnavailable(program.to_string()))
        } else {
            Ok(PathBuf::from("/usr/bin").join(program))
        }
    }
}

/// Sends the listed programs through a real `ProcessRunner` as `sh -c <script>`, with the
/// original arguments as `$@`. Everything else goes to the simulation.
pub struct ShellTools {
    process: ProcessRunner,
    pub sim: SimulatedTools,
    scripts: HashMap<&'static str, &'static str>,
}

/// Prints the file named by the last argument.
pub const CAT_LAST_ARG: &str = r#"for last; do :; done; cat "$last""#;

impl ShellTools {
    pub fn new(scripts: &[(&'static str, &'static str)]) -> Self {
        ShellTools {
            process: ProcessRunner::new(0),
            sim: SimulatedTools::new(),
            scripts: scripts.iter().copied().collect(),
        }
    }
}

impl ToolRunner for ShellTools {
    fn run<'a>(&'a self, invocation: &'a ToolInvocation) -> BoxFuture<'a, Result<ToolOutput, PipelineError>> {
        async move {
            let Some(script) = self.scripts.get(invocation.program.as_str()) else {
                return self.sim.run(invocation).await;
            };
            let mut args = vec!["-c".to_string(), script.to_string(), invocation.program.clone()];
            args.extend(invocation.args.iter().cloned());
            let shell = ToolInvocation {
                program: "sh".to_string(),
                args,
                stdout_to: invocation.stdout_to.clone(),
            };
            self.process.run(&shell).await
        }
        .boxed()
    }

    fn locate(&self, program: &str) -> Result<PathBuf, PipelineError> {
        self.sim.locate(program)
    }
}

fn flag(args: &[String], name: &str) -> Option<PathBuf> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// Input and output directories for one test run.
pub struct Workspace {
    pub tmp: TempDir,
    pub in_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl Workspace {
    pub fn new(inputs: &[&str]) -> Self {
        let tmp = TempDir::new().unwrap();
        let in_dir = tmp.path().join("reads");
        let out_dir = tmp.path().join("results");
        fs::create_dir_all(&in_dir).unwrap();
        for name in inputs {
            fs::write(in_dir.join(name), b"reads").unwrap();
        }
        Workspace { tmp, in_dir, out_dir }
    }

    pub fn config(&self) -> RunConfig {
        let mut config = RunConfig::new(self.in_dir.clone(), self.out_dir.clone());
        config.threads = 2;
        config.jobs = 2;
        config.subsample_count = 2;
        config.assemblers = vec!["flye".to_string(), "raven".to_string()];
        config
    }

    pub fn out(&self, relative: &str) -> PathBuf {
        self.out_dir.join(relative)
    }
}

pub fn pipeline(config: RunConfig, tools: &Arc<SimulatedTools>) -> Pipeline {
    let runner: Arc<dyn ToolRunner> = tools.clone();
    consensus_assembly::build(Arc::new(config), runner)
}

pub fn pipeline_with(config: RunConfig, runner: Arc<dyn ToolRunner>) -> Pipeline {
    consensus_assembly::build(Arc::new(config), runner)
}
