//! Plan reader: a pull iterator standing in for the out-of-scope plan parser.
//!
//! Re-architected per Section 9 of the spec: rather than a parser that invokes
//! registered callbacks, `PlanReader` is a pull iterator producing tagged
//! `PlanEvent`s. The Run Driver becomes a straight-line consumer (Section 4.8).
//! `YamlPlanReader` is the bundled reference implementation; anything satisfying
//! `PlanReader` works, including mocks in tests.

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use serde::Deserialize;

use crate::errors::PlanError;
use crate::model::{
    Case, Control, Definition, EventKind, EventSpec, GetFile, Set, Step, StepGroup, Suite,
};

/// One node of the plan event stream (Section 4.8, Section 9).
///
/// The parser invokes these, in order, per plan: `TdStart`, optionally
/// `HwIdDetect`, `SuiteStart`, repeated `SetProcess`, `SuiteEnd`, `TdEnd`.
#[derive(Debug)]
pub enum PlanEvent {
    TdStart(Definition),
    HwIdDetect,
    SuiteStart(Suite),
    SetProcess(Set),
    SuiteEnd,
    TdEnd,
}

/// A pull iterator over `PlanEvent`s.
pub trait PlanReader {
    /// Produce the next event, or `Ok(None)` at end-of-stream.
    fn next_event(&mut self) -> Result<Option<PlanEvent>, PlanError>;
}

// --- YAML wire format -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct YamlPlan {
    #[serde(default)]
    hwid_check: Option<String>,
    suite: YamlSuite,
}

#[derive(Debug, Deserialize)]
struct YamlSuite {
    name: String,
    #[serde(default)]
    sets: Vec<YamlSet>,
}

#[derive(Debug, Deserialize)]
struct YamlSet {
    name: String,
    #[serde(default)]
    environment: Vec<String>,
    #[serde(default)]
    hwid: String,
    #[serde(default)]
    pre_steps: Vec<YamlStepGroup>,
    #[serde(default)]
    post_steps: Vec<YamlStepGroup>,
    #[serde(default)]
    cases: Vec<YamlCase>,
    #[serde(default)]
    gets: Vec<YamlGet>,
}

#[derive(Debug, Deserialize, Default)]
struct YamlStepGroup {
    #[serde(default)]
    timeout: u32,
    #[serde(default)]
    steps: Vec<YamlStep>,
}

#[derive(Debug, Deserialize)]
struct YamlCase {
    name: String,
    #[serde(default)]
    manual: bool,
    #[serde(default)]
    state: String,
    #[serde(default)]
    timeout: u32,
    #[serde(default)]
    steps: Vec<YamlStep>,
    #[serde(default)]
    post_reboot_steps: Vec<YamlStep>,
    #[serde(default)]
    gets: Vec<YamlGet>,
}

#[derive(Debug, Deserialize)]
struct YamlStep {
    #[serde(default)]
    step: String,
    #[serde(default)]
    expected_result: Option<i32>,
    #[serde(default)]
    control: Option<String>,
    #[serde(default)]
    manual: bool,
    #[serde(default)]
    event: Option<YamlEvent>,
}

#[derive(Debug, Deserialize)]
struct YamlEvent {
    kind: String,
    resource: String,
}

#[derive(Debug, Deserialize)]
struct YamlGet {
    path: String,
    #[serde(default)]
    delete_after: bool,
    #[serde(default)]
    measurement: bool,
    #[serde(default)]
    series: bool,
}

impl From<YamlGet> for GetFile {
    fn from(g: YamlGet) -> Self {
        GetFile { path: g.path, delete_after: g.delete_after, measurement: g.measurement, series: g.series }
    }
}

impl From<YamlStep> for Step {
    fn from(s: YamlStep) -> Self {
        let mut step = Step::new(s.step);
        step.manual = s.manual;
        step.has_expected_result = s.expected_result.is_some();
        step.expected_result = s.expected_result.unwrap_or(0);
        step.control = match s.control.as_deref() {
            Some("reboot-forced") => Control::RebootForced,
            Some("reboot-expected") => Control::RebootExpected,
            _ => Control::None,
        };
        step.event = s.event.map(|e| EventSpec {
            kind: if e.kind == "wait" { EventKind::Wait } else { EventKind::Send },
            resource: e.resource,
        });
        step
    }
}

impl From<YamlStepGroup> for StepGroup {
    fn from(g: YamlStepGroup) -> Self {
        StepGroup { timeout: g.timeout, steps: g.steps.into_iter().map(Step::from).collect() }
    }
}

impl From<YamlCase> for Case {
    fn from(c: YamlCase) -> Self {
        let mut case = Case::new(c.name);
        case.manual = c.manual;
        case.state = c.state;
        case.timeout = c.timeout;
        case.steps = c.steps.into_iter().map(Step::from).collect();
        case.post_reboot_steps = c.post_reboot_steps.into_iter().map(Step::from).collect();
        case.gets = c.gets.into_iter().map(GetFile::from).collect();
        case
    }
}

impl From<YamlSet> for Set {
    fn from(s: YamlSet) -> Self {
        Set {
            name: s.name,
            environments: s.environment.into_iter().collect::<HashSet<_>>(),
            hwid: s.hwid,
            pre_steps: s.pre_steps.into_iter().map(StepGroup::from).collect(),
            post_steps: s.post_steps.into_iter().map(StepGroup::from).collect(),
            cases: s.cases.into_iter().map(Case::from).collect(),
            gets: s.gets.into_iter().map(GetFile::from).collect(),
            environment: String::new(),
        }
    }
}

/// Reference `PlanReader` backed by a single in-memory YAML document. The whole
/// document is parsed eagerly into owned entities; `next_event` then drains a
/// queue of already-materialised events, matching the ordering contract in
/// Section 6 (`td_start` -> `hwid_detect`? -> `suite_start` -> `set_process`* ->
/// `suite_end` -> `td_end`).
pub struct YamlPlanReader {
    queue: VecDeque<PlanEvent>,
}

impl YamlPlanReader {
    pub fn from_path(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self, PlanError> {
        let plan: YamlPlan = serde_yaml::from_str(content)?;
        let mut queue = VecDeque::new();

        let definition = Definition { hwid_detect_cmd: plan.hwid_check.clone(), detected_hw: None };
        queue.push_back(PlanEvent::TdStart(definition));
        if plan.hwid_check.is_some() {
            queue.push_back(PlanEvent::HwIdDetect);
        }
        queue.push_back(PlanEvent::SuiteStart(Suite { name: plan.suite.name }));
        for set in plan.suite.sets {
            queue.push_back(PlanEvent::SetProcess(Set::from(set)));
        }
        queue.push_back(PlanEvent::SuiteEnd);
        queue.push_back(PlanEvent::TdEnd);

        Ok(Self { queue })
    }
}

impl PlanReader for YamlPlanReader {
    fn next_event(&mut self) -> Result<Option<PlanEvent>, PlanError> {
        Ok(self.queue.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
suite:
  name: my-suite
  sets:
    - name: my-set
      environment: [hardware]
      cases:
        - name: case-1
          steps:
            - step: "true"
              expected_result: 0
"#;

    #[test]
    fn parses_minimal_plan_into_event_sequence() {
        let mut reader = YamlPlanReader::from_str(PLAN).unwrap();
        let mut kinds = Vec::new();
        while let Some(event) = reader.next_event().unwrap() {
            kinds.push(match event {
                PlanEvent::TdStart(_) => "td_start",
                PlanEvent::HwIdDetect => "hwid_detect",
                PlanEvent::SuiteStart(_) => "suite_start",
                PlanEvent::SetProcess(_) => "set_process",
                PlanEvent::SuiteEnd => "suite_end",
                PlanEvent::TdEnd => "td_end",
            });
        }
        assert_eq!(kinds, vec!["td_start", "suite_start", "set_process", "suite_end", "td_end"]);
    }

    #[test]
    fn hwid_check_inserts_detect_event() {
        let plan = format!("hwid_check: \"cat /etc/hwid\"\n{PLAN}");
        let mut reader = YamlPlanReader::from_str(&plan).unwrap();
        let mut saw_hwid = false;
        while let Some(event) = reader.next_event().unwrap() {
            if matches!(event, PlanEvent::HwIdDetect) {
                saw_hwid = true;
            }
        }
        assert!(saw_hwid);
    }
}
