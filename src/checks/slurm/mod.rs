//! Reports which Slurm job, if any, is running on each node.

use super::*;
use crate::common::exec;
use crate::common::{merge_dimensions, DEVICE};
use crate::trace;

use lazy_static::lazy_static;
use regex::Regex;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const NAME: &str = "slurm";
const METRIC: &str = "slurm.job_status";

const RUNNING: &str = "RUNNING";

lazy_static! {
    static ref JOB: Regex = Regex::new(concat!(
        r"^JobId=(\d+)\sJobName=([\w-]+\.[\w-]+)\s",
        r"UserId=([\w-]+\([\w-]+\)) GroupId=([\w-]+\([\w-]+\))\s.*",
        r"JobState=(\w+)\s.*\sNodeList=(.*?)\s.*$",
    ))
    .unwrap();
    static ref NODE: Regex = Regex::new(r"^NodeName=(.*?)\s.*State=(.*?)\s.*$").unwrap();
    static ref NODE_RANGE: Regex = Regex::new(r"^(.*)\[(.*)\]$").unwrap();
}

#[distributed_slice(CHECKS)]
fn init(config: Arc<Config>) -> CheckResult {
    let slurm = config.slurm();

    if !config.enabled(NAME, slurm.enabled().resolve(|| detect(slurm.scontrol()))) {
        return Ok(Vec::new());
    }

    Ok(vec![Box::new(Slurm {
        dimensions: config.dimensions(),
        scontrol: config.slurm().scontrol().to_string(),
        timeout: config.slurm().timeout(),
    })])
}

/// A Slurm client is installed when `scontrol` exists.
fn detect(scontrol: &str) -> bool {
    let found = Path::new(scontrol).exists();
    if !found {
        debug!("{scontrol} not found");
    }
    found
}

#[derive(Clone, Debug, PartialEq)]
struct Job {
    id: u64,
    name: String,
    user_id: String,
    user_group: String,
    state: String,
}

struct Slurm {
    dimensions: Dimensions,
    scontrol: String,
    timeout: Duration,
}

impl Slurm {
    async fn show(&self, entity: &str) -> Result<String, CheckError> {
        Ok(exec::output(&self.scontrol, &["-o", "show", entity], self.timeout).await?)
    }

    fn report(&self, nodes: &[String], jobs: &BTreeMap<String, Job>, sink: &mut dyn Sink) {
        for node in nodes {
            let mut dimensions = self.dimensions.clone();

            let measurement = match jobs.get(node) {
                Some(job) => {
                    let labels: Dimensions = [
                        ("user_id", &job.user_id),
                        ("user_group", &job.user_group),
                        ("job_state", &job.state),
                    ]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect();
                    merge_dimensions(&mut dimensions, &labels);
                    dimensions.insert(DEVICE.to_string(), node.clone());

                    // job names rarely make valid dimension values
                    let value_meta = HashMap::from([("job_name".to_string(), job.name.clone())]);

                    Measurement::new(METRIC, job.id as f64, dimensions).with_value_meta(value_meta)
                }
                None => {
                    dimensions.insert(DEVICE.to_string(), node.clone());
                    Measurement::new(METRIC, 0.0, dimensions)
                }
            };

            sink.gauge(measurement);
            debug!("collected slurm status for node {node}");
        }
    }
}

#[async_trait]
impl Check for Slurm {
    fn name(&self) -> &str {
        NAME
    }

    async fn check(&self, sink: &mut dyn Sink) -> Result<(), CheckError> {
        let jobs = parse_jobs(&self.show("job").await?);
        let nodes = parse_nodes(&self.show("node").await?);

        self.report(&nodes, &jobs, sink);

        Ok(())
    }
}

/// Map each node to the running job it hosts. When several jobs claim a
/// node the last one listed wins.
fn parse_jobs(output: &str) -> BTreeMap<String, Job> {
    let mut jobs = BTreeMap::new();

    for line in output.lines() {
        // "No jobs in the system" and pending jobs without a node list
        let captures = match JOB.captures(line) {
            Some(captures) => captures,
            None => continue,
        };

        let id = match captures[1].parse::<u64>() {
            Ok(id) => id,
            Err(e) => {
                debug!("invalid job id {}: {e}", &captures[1]);
                continue;
            }
        };

        let job = Job {
            id,
            name: captures[2].to_string(),
            user_id: strip_id(&captures[3]).to_string(),
            user_group: strip_id(&captures[4]).to_string(),
            state: captures[5].to_string(),
        };

        if job.state != RUNNING {
            continue;
        }

        for node in expand_nodes(&captures[6]) {
            jobs.insert(node, job.clone());
        }
    }

    jobs
}

/// Node names in the order `scontrol` lists them.
fn parse_nodes(output: &str) -> Vec<String> {
    let mut nodes: Vec<String> = Vec::new();

    for line in output.lines() {
        match NODE.captures(line) {
            Some(captures) => {
                trace!("node {} is {}", &captures[1], &captures[2]);
                if !nodes.iter().any(|n| n == &captures[1]) {
                    nodes.push(captures[1].to_string());
                }
            }
            None if line.trim().is_empty() => {}
            None => debug!("unrecognized node entry: {line}"),
        }
    }

    nodes
}

/// `john(2000)` becomes `john`.
fn strip_id(field: &str) -> &str {
    match field.find('(') {
        Some(index) => &field[..index],
        None => field,
    }
}

/// Expand a Slurm host list such as `compute-[0-2,7],login-0` into node
/// names. Zero padding in range bounds is preserved.
fn expand_nodes(list: &str) -> Vec<String> {
    let mut nodes = Vec::new();

    for entry in split_top_level(list) {
        let captures = match NODE_RANGE.captures(entry) {
            Some(captures) => captures,
            None => {
                if !entry.is_empty() {
                    nodes.push(entry.to_string());
                }
                continue;
            }
        };

        let prefix = &captures[1];

        for range in captures[2].split(',') {
            let (start, end) = range.split_once('-').unwrap_or((range, range));

            let (first, last) = match (start.parse::<u64>(), end.parse::<u64>()) {
                (Ok(first), Ok(last)) if first <= last => (first, last),
                _ => {
                    debug!("skipping invalid node range {prefix}[{range}]");
                    continue;
                }
            };

            let width = if start.len() > 1 && start.starts_with('0') {
                start.len()
            } else {
                0
            };

            nodes.extend((first..=last).map(|n| format!("{prefix}{n:0width$}")));
        }
    }

    nodes
}

// split on commas that are not inside brackets
fn split_top_level(list: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (index, c) in list.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                entries.push(&list[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    entries.push(&list[start..]);

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Recorder;

    const JOBS: &str = "\
JobId=688 JobName=test_ompi.sh UserId=john(2000) GroupId=john(2000) MCS_label=N/A Priority=4294901759 Nice=0 Account=(null) QOS=(null) JobState=RUNNING Reason=None Dependency=(null) Requeue=1 Restarts=0 BatchFlag=1 Reboot=0 ExitCode=0:0 RunTime=00:00:05 TimeLimit=UNLIMITED NodeList=openhpc-compute-[0-7] BatchHost=openhpc-compute-0 NumNodes=8 NumCPUs=8
JobId=689 JobName=test_ompi.sh UserId=john(2000) GroupId=john(2000) MCS_label=N/A Priority=4294901758 Nice=0 Account=(null) QOS=(null) JobState=RUNNING Reason=None Dependency=(null) Requeue=1 Restarts=0 BatchFlag=1 Reboot=0 ExitCode=0:0 RunTime=00:00:04 TimeLimit=UNLIMITED NodeList=openhpc-compute-[8-11] BatchHost=openhpc-compute-8 NumNodes=4 NumCPUs=4
JobId=690 JobName=test_ompi.sh UserId=john(2000) GroupId=john(2000) MCS_label=N/A Priority=4294901757 Nice=0 Account=(null) QOS=(null) JobState=RUNNING Reason=None Dependency=(null) Requeue=1 Restarts=0 BatchFlag=1 Reboot=0 ExitCode=0:0 RunTime=00:00:03 TimeLimit=UNLIMITED NodeList=openhpc-compute-[12-15] BatchHost=openhpc-compute-12 NumNodes=4 NumCPUs=4
JobId=691 JobName=test_ompi.sh UserId=john(2000) GroupId=john(2000) MCS_label=N/A Priority=4294901756 Nice=0 Account=(null) QOS=(null) JobState=PENDING Reason=Resources Dependency=(null) Requeue=1 Restarts=0 BatchFlag=1 Reboot=0 ExitCode=0:0 RunTime=00:00:00 TimeLimit=UNLIMITED NodeList=(null) NumNodes=4 NumCPUs=4
";

    fn nodes_output() -> String {
        (0..28)
            .map(|n| {
                let state = if n < 16 { "IDLE" } else { "DOWN*" };
                format!(
                    "NodeName=openhpc-compute-{n} Arch=x86_64 CoresPerSocket=1 CPUAlloc=0 CPUTot=1 State={state} ThreadsPerCore=1 Partitions=compute\n"
                )
            })
            .collect()
    }

    #[test]
    fn test_parse_jobs() {
        let jobs = parse_jobs(JOBS);
        assert_eq!(jobs.len(), 16);

        let job = &jobs["openhpc-compute-0"];
        assert_eq!(job.id, 688);
        assert_eq!(job.name, "test_ompi.sh");
        assert_eq!(job.user_id, "john");
        assert_eq!(job.user_group, "john");
        assert_eq!(job.state, "RUNNING");

        for n in 0..8 {
            assert_eq!(jobs[&format!("openhpc-compute-{n}")].id, 688);
        }
        for n in 8..12 {
            assert_eq!(jobs[&format!("openhpc-compute-{n}")].id, 689);
        }
        for n in 12..16 {
            assert_eq!(jobs[&format!("openhpc-compute-{n}")].id, 690);
        }
    }

    #[test]
    fn test_parse_jobs_none() {
        assert!(parse_jobs("No jobs in the system").is_empty());
        assert!(parse_jobs("").is_empty());
    }

    #[test]
    fn test_parse_nodes() {
        let nodes = parse_nodes(&nodes_output());
        assert_eq!(nodes.len(), 28);
        assert_eq!(nodes[0], "openhpc-compute-0");
        assert_eq!(nodes[27], "openhpc-compute-27");
    }

    #[test]
    fn test_strip_id() {
        assert_eq!(strip_id("john(2000)"), "john");
        assert_eq!(strip_id("research-group(5001)"), "research-group");
        assert_eq!(strip_id("john"), "john");
    }

    #[test]
    fn test_expand_nodes() {
        assert_eq!(
            expand_nodes("openhpc-compute-[0-2]"),
            vec!["openhpc-compute-0", "openhpc-compute-1", "openhpc-compute-2"]
        );
        assert_eq!(
            expand_nodes("openhpc-compute-[99-101]"),
            vec!["openhpc-compute-99", "openhpc-compute-100", "openhpc-compute-101"]
        );
        assert_eq!(expand_nodes("openhpc-compute-3"), vec!["openhpc-compute-3"]);
        assert_eq!(expand_nodes("openhpc-compute-1343"), vec!["openhpc-compute-1343"]);
        assert_eq!(
            expand_nodes("gpu[1,3,5-7]"),
            vec!["gpu1", "gpu3", "gpu5", "gpu6", "gpu7"]
        );
    }

    #[test]
    fn test_expand_nodes_padding_and_lists() {
        assert_eq!(expand_nodes("node[08-10]"), vec!["node08", "node09", "node10"]);
        assert_eq!(
            expand_nodes("gpu[01-02],login-0"),
            vec!["gpu01", "gpu02", "login-0"]
        );
        assert_eq!(expand_nodes("node[3-1,x,4]"), vec!["node4"]);
    }

    fn check() -> Slurm {
        Slurm {
            dimensions: [("hostname".to_string(), "openhpc-login-0".to_string())]
                .into_iter()
                .collect(),
            scontrol: "/usr/bin/scontrol".into(),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_report() {
        let mut recorder = Recorder::default();
        let check = check();

        check.report(&parse_nodes(&nodes_output()), &parse_jobs(JOBS), &mut recorder);

        assert_eq!(recorder.gauges.len(), 28);
        assert!(recorder.gauges.iter().all(|g| g.name == "slurm.job_status"));

        let busy = &recorder.gauges[14];
        assert_eq!(busy.value, 690.0);
        assert_eq!(busy.dimensions["device"], "openhpc-compute-14");
        assert_eq!(busy.dimensions["hostname"], "openhpc-login-0");
        assert_eq!(busy.dimensions["user_id"], "john");
        assert_eq!(busy.dimensions["user_group"], "john");
        assert_eq!(busy.dimensions["job_state"], "RUNNING");
        assert_eq!(
            busy.value_meta.as_ref().unwrap()["job_name"],
            "test_ompi.sh"
        );

        let idle = &recorder.gauges[20];
        assert_eq!(idle.value, 0.0);
        assert_eq!(idle.dimensions.len(), 2);
        assert_eq!(idle.dimensions["device"], "openhpc-compute-20");
        assert!(idle.value_meta.is_none());
    }

    #[tokio::test]
    async fn test_scontrol_failure() {
        let mut check = check();
        check.scontrol = "false".into();
        let mut recorder = Recorder::default();

        assert!(check.check(&mut recorder).await.is_err());
        assert!(recorder.gauges.is_empty());
    }

    #[test]
    fn test_init() {
        let config: Config = toml::from_str("").unwrap();
        assert!(init(Arc::new(config)).unwrap().is_empty());

        let config: Config = toml::from_str("[slurm]\nenabled = true").unwrap();
        let checks = init(Arc::new(config)).unwrap();
        assert_eq!(checks[0].name(), "slurm");
    }

    #[test]
    fn test_detect() {
        let scontrol = tempfile::NamedTempFile::new().unwrap();
        assert!(detect(&scontrol.path().to_string_lossy()));
        assert!(!detect("/nonexistent/bin/scontrol"));
    }

    #[test]
    fn test_init_auto() {
        let scontrol = tempfile::NamedTempFile::new().unwrap();
        let text = format!(
            "[slurm]\nenabled = \"auto\"\nscontrol = \"{}\"\n",
            scontrol.path().display()
        );
        let config: Config = toml::from_str(&text).unwrap();
        assert_eq!(init(Arc::new(config)).unwrap().len(), 1);

        let config: Config = toml::from_str(
            "[slurm]\nenabled = \"auto\"\nscontrol = \"/nonexistent/bin/scontrol\"\n",
        )
        .unwrap();
        assert!(init(Arc::new(config)).unwrap().is_empty());

        // an explicit enable skips detection
        let config: Config = toml::from_str(
            "[slurm]\nenabled = true\nscontrol = \"/nonexistent/bin/scontrol\"\n",
        )
        .unwrap();
        assert_eq!(init(Arc::new(config)).unwrap().len(), 1);
    }
}
