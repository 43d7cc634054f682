use std::{collections::HashMap, fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// The runtimes this agent can execute. One container image per runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Runtime {
    Python,
    Cpp,
    Nodejs,
    Go,
}

impl Runtime {
    pub const ALL: [Runtime; 4] = [Runtime::Python, Runtime::Cpp, Runtime::Nodejs, Runtime::Go];

    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Python => "python",
            Runtime::Cpp => "cpp",
            Runtime::Nodejs => "nodejs",
            Runtime::Go => "go",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = String;

    // Accepts the alias spellings callers actually send, not just the
    // canonical names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Ok(Runtime::Python),
            "cpp" | "c++" => Ok(Runtime::Cpp),
            "nodejs" | "node" | "javascript" | "js" => Ok(Runtime::Nodejs),
            "go" | "golang" => Ok(Runtime::Go),
            other => Err(format!("unsupported runtime: {other}")),
        }
    }
}

impl Serialize for Runtime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Runtime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Static per-runtime knobs. The table is the single source of truth for
/// runtime dispatch: adding a runtime is an entry here plus an image.
#[derive(Debug, Clone)]
pub struct RuntimeDescriptor {
    pub runtime: Runtime,
    /// Container image the warm pool provisions for this runtime.
    pub image: String,
    /// Files that must be present in the bundle root for detection. The
    /// first element is the entrypoint proper.
    pub required_files: &'static [&'static str],
    /// Argv executed inside the container, workdir set to the workspace.
    pub launch_command: &'static [&'static str],
    pub default_wall_clock_ms: u64,
    /// Compiled runtimes go through an in-container `run.sh` build step.
    pub requires_build: bool,
}

impl RuntimeDescriptor {
    pub fn entrypoint_file(&self) -> &'static str {
        self.required_files[0]
    }

    pub fn launch_argv(&self) -> Vec<String> {
        self.launch_command.iter().map(|s| s.to_string()).collect()
    }
}

/// Per-runtime image tags, resolved from configuration at startup.
#[derive(Debug, Clone)]
pub struct RuntimeImages {
    pub python: String,
    pub cpp: String,
    pub nodejs: String,
    pub go: String,
}

/// The runtime descriptor table, built once at startup.
#[derive(Debug)]
pub struct RuntimeTable {
    entries: HashMap<Runtime, RuntimeDescriptor>,
}

impl RuntimeTable {
    pub fn new(images: RuntimeImages, default_wall_clock_ms: u64) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            Runtime::Python,
            RuntimeDescriptor {
                runtime: Runtime::Python,
                image: images.python,
                required_files: &["main.py"],
                launch_command: &["python", "main.py"],
                default_wall_clock_ms,
                requires_build: false,
            },
        );
        entries.insert(
            Runtime::Cpp,
            RuntimeDescriptor {
                runtime: Runtime::Cpp,
                image: images.cpp,
                required_files: &["main.cpp", "run.sh"],
                launch_command: &["/bin/bash", "run.sh"],
                default_wall_clock_ms,
                requires_build: true,
            },
        );
        entries.insert(
            Runtime::Nodejs,
            RuntimeDescriptor {
                runtime: Runtime::Nodejs,
                image: images.nodejs,
                required_files: &["index.js"],
                launch_command: &["node", "index.js"],
                default_wall_clock_ms,
                requires_build: false,
            },
        );
        entries.insert(
            Runtime::Go,
            RuntimeDescriptor {
                runtime: Runtime::Go,
                image: images.go,
                required_files: &["main.go", "run.sh"],
                launch_command: &["/bin/bash", "run.sh"],
                default_wall_clock_ms,
                requires_build: true,
            },
        );
        Self { entries }
    }

    pub fn descriptor(&self, runtime: Runtime) -> &RuntimeDescriptor {
        // The table is total over Runtime by construction.
        &self.entries[&runtime]
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuntimeDescriptor> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RuntimeTable {
        RuntimeTable::new(
            RuntimeImages {
                python: "python-base".into(),
                cpp: "gcc-base".into(),
                nodejs: "node-base".into(),
                go: "go-base".into(),
            },
            10_000,
        )
    }

    #[test]
    fn runtime_aliases_parse() {
        assert_eq!("python".parse::<Runtime>().unwrap(), Runtime::Python);
        assert_eq!("c++".parse::<Runtime>().unwrap(), Runtime::Cpp);
        assert_eq!("node".parse::<Runtime>().unwrap(), Runtime::Nodejs);
        assert_eq!("JS".parse::<Runtime>().unwrap(), Runtime::Nodejs);
        assert_eq!("golang".parse::<Runtime>().unwrap(), Runtime::Go);
        assert!("ruby".parse::<Runtime>().is_err());
    }

    #[test]
    fn table_is_total_and_consistent() {
        let table = table();
        for rt in Runtime::ALL {
            let desc = table.descriptor(rt);
            assert_eq!(desc.runtime, rt);
            assert!(!desc.required_files.is_empty());
            assert!(!desc.launch_command.is_empty());
        }
        assert!(table.descriptor(Runtime::Cpp).requires_build);
        assert!(table.descriptor(Runtime::Go).requires_build);
        assert!(!table.descriptor(Runtime::Python).requires_build);
    }

    #[test]
    fn serde_uses_canonical_lowercase() {
        let json = serde_json::to_string(&Runtime::Nodejs).unwrap();
        assert_eq!(json, "\"nodejs\"");
        let rt: Runtime = serde_json::from_str("\"node\"").unwrap();
        assert_eq!(rt, Runtime::Nodejs);
    }
}
