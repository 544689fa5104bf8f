use std::fmt::{self, Display};
use std::ops::{AddAssign, SubAssign};

use serde::{Deserialize, Serialize};

use crate::config::Options;
use crate::graph::{CpuRequirement, Network, Node};

/// Named concurrency budgets. Used both as the pool capacity and as the
/// demand of a single task; a missing dimension counts as zero.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cpu: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub io: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub download: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub upload: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub test: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu: 0,
        io: 0,
        download: 0,
        upload: 0,
        test: 0,
    };

    pub fn cpu(n: u32) -> Self {
        Self { cpu: n, ..Self::ZERO }
    }

    pub fn io(n: u32) -> Self {
        Self { io: n, ..Self::ZERO }
    }

    pub fn download(n: u32) -> Self {
        Self {
            download: n,
            ..Self::ZERO
        }
    }

    pub fn upload(n: u32) -> Self {
        Self {
            upload: n,
            ..Self::ZERO
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    fn dims(&self) -> [u32; 5] {
        [self.cpu, self.io, self.download, self.upload, self.test]
    }

    /// True when `self` can be added to `usage` without exceeding
    /// `capacity` in any dimension.
    pub fn fits(&self, usage: &Resources, capacity: &Resources) -> bool {
        self.dims()
            .iter()
            .zip(usage.dims())
            .zip(capacity.dims())
            .all(|((need, used), cap)| need + used <= cap)
    }

    /// Per-dimension minimum; keeps a single task from demanding more than
    /// the whole pool could ever grant.
    pub fn clamp_to(self, capacity: &Resources) -> Self {
        Self {
            cpu: self.cpu.min(capacity.cpu),
            io: self.io.min(capacity.io),
            download: self.download.min(capacity.download),
            upload: self.upload.min(capacity.upload),
            test: self.test.min(capacity.test),
        }
    }

    /// Capacity vector derived from thread options.
    pub fn capacity(options: &Options) -> Self {
        let threads = options.build_threads as u32;
        Self {
            cpu: threads,
            io: (options.link_threads as u32).min(threads).max(1),
            download: threads + options.net_threads as u32,
            upload: (options.net_threads as u32).max(1),
            test: options.test_threads() as u32,
        }
    }

    /// Demand of the task that runs a node's commands.
    pub fn for_node(node: &Node, capacity: &Resources) -> Self {
        let cpu = match node.requirements.cpu {
            CpuRequirement::Count(n) => n,
            CpuRequirement::Named(_) => capacity.cpu,
        };

        let mut demand = match node.kind() {
            "AR" | "LD" => Resources::io(1),
            _ => Resources::cpu(cpu),
        };

        if node.requirements.network == Network::Full {
            demand.download += 1;
        }

        if node.is_test() {
            demand.test += 1;
        }

        demand.clamp_to(capacity)
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Self) {
        self.cpu += rhs.cpu;
        self.io += rhs.io;
        self.download += rhs.download;
        self.upload += rhs.upload;
        self.test += rhs.test;
    }
}

impl SubAssign for Resources {
    fn sub_assign(&mut self, rhs: Self) {
        self.cpu = self.cpu.saturating_sub(rhs.cpu);
        self.io = self.io.saturating_sub(rhs.io);
        self.download = self.download.saturating_sub(rhs.download);
        self.upload = self.upload.saturating_sub(rhs.upload);
        self.test = self.test.saturating_sub(rhs.test);
    }
}

impl Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = ["cpu", "io", "download", "upload", "test"];
        let mut first = true;
        for (name, value) in names.iter().zip(self.dims()) {
            if value == 0 {
                continue;
            }
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CpuNamed, Graph, GraphDescriptor, Requirements};

    #[test]
    fn fits_checks_every_dimension() {
        let cap = Resources {
            cpu: 2,
            io: 1,
            ..Resources::ZERO
        };
        let mut usage = Resources::cpu(1);
        assert!(Resources::cpu(1).fits(&usage, &cap));
        assert!(!Resources::cpu(2).fits(&usage, &cap));
        assert!(Resources::io(1).fits(&usage, &cap));
        assert!(!Resources::download(1).fits(&usage, &cap));

        usage += Resources::io(1);
        assert!(!Resources::io(1).fits(&usage, &cap));
        usage -= Resources::io(1);
        assert!(Resources::io(1).fits(&usage, &cap));
        assert!(Resources::ZERO.fits(&cap, &cap));
    }

    #[test]
    fn capacity_from_options() {
        let options = Options {
            build_threads: 4,
            link_threads: 8,
            net_threads: 2,
            test_threads: Some(3),
            ..Options::default()
        };
        let cap = Resources::capacity(&options);
        assert_eq!(cap.cpu, 4);
        assert_eq!(cap.io, 4);
        assert_eq!(cap.download, 6);
        assert_eq!(cap.upload, 2);
        assert_eq!(cap.test, 3);
    }

    #[test]
    fn node_demand_is_clamped() {
        let mut spec = crate::graph::tests::spec("t", &[]);
        spec.requirements = Requirements {
            cpu: CpuRequirement::Count(16),
            network: Network::Full,
            test: true,
        };
        let mut link = crate::graph::tests::spec("l", &[]);
        link.kv.insert("p".into(), "LD".into());
        let mut all = crate::graph::tests::spec("a", &[]);
        all.requirements.cpu = CpuRequirement::Named(CpuNamed::All);

        let graph = Graph::from_descriptor(GraphDescriptor {
            graph: vec![spec, link, all],
            result: vec!["t".into(), "l".into(), "a".into()],
            ..Default::default()
        })
        .unwrap();

        let cap = Resources {
            cpu: 4,
            io: 2,
            download: 4,
            upload: 1,
            test: 2,
        };
        let t = Resources::for_node(graph.node(graph.find("t").unwrap()), &cap);
        assert_eq!(
            t,
            Resources {
                cpu: 4,
                download: 1,
                test: 1,
                ..Resources::ZERO
            }
        );
        let l = Resources::for_node(graph.node(graph.find("l").unwrap()), &cap);
        assert_eq!(l, Resources::io(1));
        let a = Resources::for_node(graph.node(graph.find("a").unwrap()), &cap);
        assert_eq!(a, Resources::cpu(4));
    }

    #[test]
    fn display_lists_nonzero() {
        assert_eq!(Resources::ZERO.to_string(), "none");
        let r = Resources {
            cpu: 2,
            upload: 1,
            ..Resources::ZERO
        };
        assert_eq!(r.to_string(), "cpu=2,upload=1");
    }
}
