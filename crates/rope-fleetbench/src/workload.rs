//! Workload descriptions and load agent invocations

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::types::Machine;

/// Grace period granted to stragglers after the nominal duration
pub const STRAGGLER_GRACE: Duration = Duration::from_secs(120);

/// Lower bound on the generator timeout
pub const MIN_GENERATOR_TIMEOUT: Duration = Duration::from_secs(300);

/// Default workload duration
pub const DEFAULT_DURATION: Duration = Duration::from_secs(300);

/// Prefix of persisted command-list files
pub const COMMAND_FILE_PREFIX: &str = "workload-generator-cmd-";

/// Timeout after which a load agent is killed: `max(duration + 120s, 300s)`.
///
/// Requests taking longer than two minutes past the run are not worth waiting for.
pub fn generator_timeout(duration: Duration) -> Duration {
    (duration + STRAGGLER_GRACE).max(MIN_GENERATOR_TIMEOUT)
}

/// Split `total` requests per second over `n` machines, remainder going to the first ones
pub fn distribute_load(total: u64, n: usize) -> Vec<u64> {
    if n == 0 {
        return Vec::new();
    }
    let n64 = n as u64;
    let base = total / n64;
    let remainder = (total % n64) as usize;
    (0..n)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Immutable description of the load issued during one run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkloadDescription {
    pub resource_ids: Vec<String>,
    /// Agent request method (`Query` or `Update`)
    pub method: String,
    /// Method invoked on the resources
    pub call_method: Option<String>,
    pub requests_per_second: u64,
    pub duration: Duration,
    pub payload: Option<Vec<u8>>,
    pub arguments: Vec<String>,
}

/// Parameters of one `run_workload` call
#[derive(Clone, Debug)]
pub struct WorkloadRequest {
    pub machines: Vec<Machine>,
    pub targets: Vec<String>,
    pub requests_per_second: u64,
    /// Falls back to the configured resource ids
    pub resource_ids: Option<Vec<String>>,
    pub duration: Duration,
    pub payload: Option<Vec<u8>>,
    /// Falls back to the configured request kind
    pub method: Option<String>,
    pub call_method: Option<String>,
    pub arguments: Vec<String>,
}

impl WorkloadRequest {
    pub fn new(machines: Vec<Machine>, targets: Vec<String>, requests_per_second: u64) -> Self {
        Self {
            machines,
            targets,
            requests_per_second,
            resource_ids: None,
            duration: DEFAULT_DURATION,
            payload: None,
            method: None,
            call_method: None,
            arguments: Vec::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_call_method(mut self, call_method: impl Into<String>) -> Self {
        self.call_method = Some(call_method.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }
}

/// One agent invocation on one driver machine
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratorPlan {
    pub machine: Machine,
    pub targets: Vec<String>,
    pub requests_per_second: u64,
    pub command: String,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Endpoint URL of a target node
pub fn target_url(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("http://[{}]:{}", address, port)
    } else {
        format!("http://{}:{}", address, port)
    }
}

/// Agent command line for one machine
pub fn agent_command(
    agent: &AgentConfig,
    description: &WorkloadDescription,
    targets: &[String],
    requests_per_second: u64,
) -> String {
    let urls = targets
        .iter()
        .map(|t| target_url(t, agent.target_port))
        .collect::<Vec<_>>()
        .join(",");

    let mut cmd = format!(
        "./{} \"{}\" -r {} -n {} -m {} --summary-file {}",
        agent.binary,
        urls,
        requests_per_second,
        description.duration.as_secs(),
        description.method,
        agent.summary_file,
    );
    if !description.resource_ids.is_empty() {
        cmd.push_str(&format!(" --canister-id {}", description.resource_ids.join(",")));
    }
    if let Some(call_method) = &description.call_method {
        cmd.push_str(&format!(" --call-method \"{}\"", call_method));
    }
    if let Some(payload) = &description.payload {
        cmd.push_str(&format!(" --payload '{}'", hex::encode(payload)));
    }
    for argument in &description.arguments {
        cmd.push(' ');
        cmd.push_str(argument);
    }
    cmd
}

/// Plan one agent per machine, each sending its share of the load to every target.
///
/// Machines whose share is zero get no agent.
pub fn plan_generators(
    agent: &AgentConfig,
    description: &WorkloadDescription,
    machines: &[Machine],
    targets: &[String],
    outdir: &Path,
) -> Vec<GeneratorPlan> {
    let shares = distribute_load(description.requests_per_second, machines.len());
    machines
        .iter()
        .zip(shares)
        .filter(|(_, rps)| *rps > 0)
        .map(|(machine, rps)| GeneratorPlan {
            machine: machine.clone(),
            targets: targets.to_vec(),
            requests_per_second: rps,
            command: agent_command(agent, description, targets, rps),
            stdout: outdir.join(format!("workload-generator-{}.stdout.txt", machine)),
            stderr: outdir.join(format!("workload-generator-{}.stderr.txt", machine)),
        })
        .collect()
}

/// Local destination of a machine's summary file
pub fn summary_path(outdir: &Path, machine: &Machine) -> PathBuf {
    outdir.join(format!("summary_machine_{}", machine.file_safe()))
}

/// Persist `commands` to the first `workload-generator-cmd-<N>` (N >= 1) not yet present in `dir`
pub fn write_command_file(dir: &Path, commands: &[String]) -> Result<PathBuf> {
    let mut n = 0u32;
    loop {
        n += 1;
        let path = dir.join(format!("{}{}", COMMAND_FILE_PREFIX, n));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                for command in commands {
                    writeln!(file, "{}", command)?;
                }
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("{} already exists, trying next sequential file name", path.display());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn description() -> WorkloadDescription {
        WorkloadDescription {
            resource_ids: vec!["rrkah-fqaaa".to_string()],
            method: "Query".to_string(),
            call_method: Some("read".to_string()),
            requests_per_second: 100,
            duration: Duration::from_secs(60),
            payload: Some(vec![0xde, 0xad]),
            arguments: vec!["--no-status-check".to_string()],
        }
    }

    #[test]
    fn test_generator_timeout_examples() {
        assert_eq!(generator_timeout(Duration::ZERO), Duration::from_secs(300));
        assert_eq!(generator_timeout(Duration::from_secs(180)), Duration::from_secs(300));
        assert_eq!(generator_timeout(Duration::from_secs(600)), Duration::from_secs(720));
    }

    proptest! {
        #[test]
        fn prop_generator_timeout(secs in 0u64..1_000_000) {
            let expected = std::cmp::max(secs + 120, 300);
            prop_assert_eq!(generator_timeout(Duration::from_secs(secs)), Duration::from_secs(expected));
        }

        #[test]
        fn prop_distribute_load_sums(total in 0u64..100_000, n in 1usize..64) {
            let shares = distribute_load(total, n);
            prop_assert_eq!(shares.len(), n);
            prop_assert_eq!(shares.iter().sum::<u64>(), total);
            let max = *shares.iter().max().unwrap();
            let min = *shares.iter().min().unwrap();
            prop_assert!(max - min <= 1);
        }
    }

    #[test]
    fn test_agent_command() {
        let agent = AgentConfig::default();
        let cmd = agent_command(
            &agent,
            &description(),
            &["10.0.0.1".to_string(), "2001:db8::1".to_string()],
            50,
        );

        assert_eq!(
            cmd,
            "./workload-generator \"http://10.0.0.1:8080,http://[2001:db8::1]:8080\" \
             -r 50 -n 60 -m Query --summary-file wg_summary --canister-id rrkah-fqaaa \
             --call-method \"read\" --payload 'dead' --no-status-check"
        );
    }

    #[test]
    fn test_plan_generators_splits_load() {
        let agent = AgentConfig::default();
        let machines = vec![Machine::new("m1"), Machine::new("m2"), Machine::new("m3")];
        let plans = plan_generators(
            &agent,
            &description(),
            &machines,
            &["10.0.0.1".to_string()],
            Path::new("/out"),
        );

        let shares: Vec<u64> = plans.iter().map(|p| p.requests_per_second).collect();
        assert_eq!(shares, vec![34, 33, 33]);
        assert_eq!(plans[1].stdout, PathBuf::from("/out/workload-generator-m2.stdout.txt"));
        assert!(plans[0].command.contains("-r 34"));
    }

    #[test]
    fn test_plan_generators_skips_zero_shares() {
        let machines = vec![Machine::new("m1"), Machine::new("m2"), Machine::new("m3")];
        let description = WorkloadDescription {
            requests_per_second: 2,
            ..description()
        };
        let plans = plan_generators(
            &AgentConfig::default(),
            &description,
            &machines,
            &["10.0.0.1".to_string()],
            Path::new("/out"),
        );

        let planned: Vec<&str> = plans.iter().map(|p| p.machine.address()).collect();
        assert_eq!(planned, vec!["m1", "m2"]);
        assert!(plans.iter().all(|p| !p.command.contains("-r 0 ")));
    }

    #[test]
    fn test_summary_path() {
        let path = summary_path(Path::new("/out"), &Machine::new("2001:db8::1"));
        assert_eq!(path, PathBuf::from("/out/summary_machine_2001_db8__1"));
    }

    #[test]
    fn test_command_file_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        for n in 1..=3 {
            std::fs::write(dir.path().join(format!("{}{}", COMMAND_FILE_PREFIX, n)), "old").unwrap();
        }

        let path = write_command_file(dir.path(), &["a".to_string(), "b".to_string()]).unwrap();

        assert_eq!(path, dir.path().join("workload-generator-cmd-4"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
        for n in 1..=3 {
            let old = std::fs::read_to_string(dir.path().join(format!("{}{}", COMMAND_FILE_PREFIX, n)));
            assert_eq!(old.unwrap(), "old");
        }
    }
}
