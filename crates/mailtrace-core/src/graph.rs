use std::io::{self, Write};

use crate::hop::HopStep;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from_host: String,
    pub to_host: String,
    /// Queue id on `from_host` that was handed over.
    pub queue_id: String
}

/// Directed host graph built from traced hops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailGraph {
    hosts: Vec<String>,
    edges: Vec<Edge>
}

impl MailGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one hop; repeated hops are kept once.
    pub fn add_hop(
        &mut self,
        from_host: &str,
        to_host: &str,
        queue_id: &str
    ) {
        self.add_host(from_host);
        self.add_host(to_host);

        let exists = self.edges.iter().any(|edge| {
            edge.from_host == from_host && edge.to_host == to_host && edge.queue_id == queue_id
        });
        if !exists {
            self.edges.push(Edge {
                from_host: from_host.to_string(),
                to_host: to_host.to_string(),
                queue_id: queue_id.to_string()
            });
        }
    }

    pub fn add_steps(
        &mut self,
        steps: &[HopStep]
    ) {
        for step in steps {
            self.add_hop(&step.from_host, &step.relay.relay_host, &step.mail_id);
        }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Writes the graph in Graphviz dot syntax.
    pub fn to_dot<W: Write>(
        &self,
        out: &mut W
    ) -> io::Result<()> {
        writeln!(out, "digraph mailtrace {{")?;
        writeln!(out, "    rankdir=LR;")?;
        for host in &self.hosts {
            writeln!(out, "    \"{}\";", escape(host))?;
        }
        for edge in &self.edges {
            writeln!(
                out,
                "    \"{}\" -> \"{}\" [label=\"{}\"];",
                escape(&edge.from_host),
                escape(&edge.to_host),
                escape(&edge.queue_id)
            )?;
        }
        writeln!(out, "}}")?;
        out.flush()
    }

    fn add_host(
        &mut self,
        host: &str
    ) {
        if !self.hosts.iter().any(|known| known == host) {
            self.hosts.push(host.to_string());
        }
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn duplicate_hops_are_recorded_once() {
        let mut graph = MailGraph::new();
        graph.add_hop("mx1", "mx2", "AAA111");
        graph.add_hop("mx1", "mx2", "AAA111");
        graph.add_hop("mx1", "mx2", "DDD444");
        graph.add_hop("mx2", "mx3", "BBB222");

        assert_eq!(graph.hosts(), &["mx1", "mx2", "mx3"]);
        assert_eq!(graph.edges().len(), 3);
    }

    #[test]
    fn renders_dot() {
        let mut graph = MailGraph::new();
        graph.add_hop("mx1", "relay \"b\"", "AAA111");

        let mut out = Vec::new();
        graph.to_dot(&mut out).expect("write to vec");
        let dot = String::from_utf8(out).expect("utf8");

        assert_eq!(
            dot,
            "digraph mailtrace {\n    rankdir=LR;\n    \"mx1\";\n    \"relay \\\"b\\\"\";\n    \
             \"mx1\" -> \"relay \\\"b\\\"\" [label=\"AAA111\"];\n}\n"
        );
    }
}
