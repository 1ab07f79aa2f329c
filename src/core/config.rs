use std::convert::TryFrom;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

/// Cost model selector, enumerated the way the scheduler configuration
/// surface exposes it.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum CostModelKind {
    Trivial = 0,
    Random = 1,
    Sjf = 2,
    Quincy = 3,
    Whare = 4,
    Coco = 5,
    Octopus = 6,
    SimulatedQuincy = 8,
}

impl TryFrom<i32> for CostModelKind {
    type Error = anyhow::Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CostModelKind::Trivial),
            1 => Ok(CostModelKind::Random),
            2 => Ok(CostModelKind::Sjf),
            3 => Ok(CostModelKind::Quincy),
            4 => Ok(CostModelKind::Whare),
            5 => Ok(CostModelKind::Coco),
            6 => Ok(CostModelKind::Octopus),
            8 => Ok(CostModelKind::SimulatedQuincy),
            _ => Err(anyhow!("unknown cost model selector ({})", value)),
        }
    }
}

impl<'a> TryFrom<&'a str> for CostModelKind {
    type Error = anyhow::Error;

    fn try_from(value: &'a str) -> Result<Self, Self::Error> {
        let value = value.to_ascii_lowercase();
        match value.as_str() {
            "trivial" => Ok(CostModelKind::Trivial),
            "random" => Ok(CostModelKind::Random),
            "sjf" => Ok(CostModelKind::Sjf),
            "quincy" => Ok(CostModelKind::Quincy),
            "whare" => Ok(CostModelKind::Whare),
            "coco" => Ok(CostModelKind::Coco),
            "octopus" => Ok(CostModelKind::Octopus),
            "simulated_quincy" => Ok(CostModelKind::SimulatedQuincy),
            _ => Err(anyhow!("unknown cost model selector ({})", value)),
        }
    }
}

impl std::fmt::Display for CostModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CostModelKind::Trivial => write!(f, "Trivial"),
            CostModelKind::Random => write!(f, "Random"),
            CostModelKind::Sjf => write!(f, "Sjf"),
            CostModelKind::Quincy => write!(f, "Quincy"),
            CostModelKind::Whare => write!(f, "Whare"),
            CostModelKind::Coco => write!(f, "Coco"),
            CostModelKind::Octopus => write!(f, "Octopus"),
            CostModelKind::SimulatedQuincy => write!(f, "SimulatedQuincy"),
        }
    }
}

/// Immutable scheduler configuration, fixed at construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingParameters {
    /// which bundled cost model drives arc costs
    pub cost_model: CostModelKind,

    /// refresh interval for time-dependent arc costs, micros
    pub time_dependent_cost_update_frequency: u64,

    /// dump the cost model's CSV debug info after every iteration
    pub debug_cost_model: bool,
    pub debug_output_dir: String,

    /// wall-clock budget for one solver run, millis; `None` waits forever
    pub solver_deadline_ms: Option<u64>,
    /// external solver binary; `None` selects the in-process solver
    pub solver_binary: Option<String>,
}

impl Default for SchedulingParameters {
    fn default() -> Self {
        SchedulingParameters {
            cost_model: CostModelKind::Trivial,
            time_dependent_cost_update_frequency: 10_000_000,
            debug_cost_model: false,
            debug_output_dir: "/tmp".to_string(),
            solver_deadline_ms: None,
            solver_binary: None,
        }
    }
}

impl SchedulingParameters {
    /// load yaml config from path
    pub fn load_config(path: PathBuf) -> anyhow::Result<SchedulingParameters> {
        let context =
            read_config_from_path(path).map_err(|e| anyhow!("read scheduler config error {}", e))?;
        serde_yaml::from_str(&context).map_err(|e| anyhow!("parse scheduler config error {}", e))
    }
}

/// load text config from path
pub fn read_config_from_path(path: PathBuf) -> Result<String, std::io::Error> {
    let mut file = File::open(path)?;
    let mut buffer = String::new();
    file.read_to_string(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use crate::core::config::{CostModelKind, SchedulingParameters};

    #[test]
    pub fn cost_model_kind_parse_test() {
        assert_eq!(CostModelKind::try_from(3).unwrap(), CostModelKind::Quincy);
        assert_eq!(
            CostModelKind::try_from("octopus").unwrap(),
            CostModelKind::Octopus
        );
        assert!(CostModelKind::try_from(7).is_err());
        assert!(CostModelKind::try_from(99).is_err());
        assert!(CostModelKind::try_from("fancy").is_err());
    }

    #[test]
    pub fn ser_parameters_test() {
        let params = SchedulingParameters::default();

        let yaml = serde_yaml::to_string(&params).unwrap();
        let params1: SchedulingParameters = serde_yaml::from_str(yaml.as_str()).unwrap();

        assert_eq!(params, params1);
    }
}
