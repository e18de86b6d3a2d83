// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The port-binding graph of a system.
//!
//! Nodes are modules and edges point from a master port to the slave port
//! it issues requests into.

use crate::sim::ModuleId;
use crate::Error;

use itertools::Itertools;
use petgraph::algo::{is_cyclic_directed, kosaraju_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Binding {
    pub master_port: usize,
    pub slave_port: usize,
}

#[derive(Debug, Default)]
pub struct Netlist {
    graph: DiGraph<String, Binding>,
    masters: HashSet<(ModuleId, usize)>,
    slaves: HashSet<(ModuleId, usize)>,
}

impl Netlist {
    /// Modules must be added in id order so node indices match ids.
    pub fn add_module(&mut self, id: ModuleId, name: &str) {
        let node = self.graph.add_node(name.to_string());
        debug_assert_eq!(node.index(), id.index());
    }

    pub fn name(&self, id: ModuleId) -> &str {
        &self.graph[NodeIndex::new(id.index())]
    }

    pub fn add_binding(
        &mut self,
        master: ModuleId,
        master_port: usize,
        slave: ModuleId,
        slave_port: usize,
    ) -> Result<(), Error> {
        if !self.masters.insert((master, master_port)) {
            return Err(Error::AlreadyBound {
                module: self.name(master).to_string(),
                port: master_port,
            });
        }
        if !self.slaves.insert((slave, slave_port)) {
            self.masters.remove(&(master, master_port));
            return Err(Error::AlreadyBound {
                module: self.name(slave).to_string(),
                port: slave_port,
            });
        }
        log::debug!(
            "binding {}[{}] -> {}[{}]",
            self.name(master),
            master_port,
            self.name(slave),
            slave_port
        );
        self.graph.add_edge(
            NodeIndex::new(master.index()),
            NodeIndex::new(slave.index()),
            Binding {
                master_port,
                slave_port,
            },
        );
        Ok(())
    }

    pub fn num_bindings(&self) -> usize {
        self.graph.edge_count()
    }

    /// Rejects request paths that loop back into a module.
    pub fn check(&self) -> Result<(), Error> {
        if !is_cyclic_directed(&self.graph) {
            return Ok(());
        }
        let cycle = kosaraju_scc(&self.graph)
            .into_iter()
            .find(|component| {
                component.len() > 1
                    || self
                        .graph
                        .find_edge(component[0], component[0])
                        .is_some()
            })
            .map(|component| {
                component
                    .iter()
                    .map(|node| self.graph[*node].as_str())
                    .sorted()
                    .join(", ")
            })
            .unwrap_or_default();
        Err(Error::BindingCycle(cycle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn netlist(names: &[&str]) -> (Netlist, Vec<ModuleId>) {
        let mut netlist = Netlist::default();
        let ids = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let id = ModuleId::from_index(i);
                netlist.add_module(id, name);
                id
            })
            .collect();
        (netlist, ids)
    }

    #[test]
    fn test_chain_is_accepted() {
        let (mut netlist, ids) = netlist(&["master", "trace", "memory"]);
        netlist.add_binding(ids[0], 0, ids[1], 0).unwrap();
        netlist.add_binding(ids[1], 0, ids[2], 0).unwrap();
        assert_eq!(netlist.num_bindings(), 2);
        netlist.check().unwrap();
    }

    #[test]
    fn test_double_binding_rejected() {
        let (mut netlist, ids) = netlist(&["master", "memory", "other"]);
        netlist.add_binding(ids[0], 0, ids[1], 0).unwrap();
        assert_eq!(
            netlist.add_binding(ids[0], 0, ids[2], 0),
            Err(Error::AlreadyBound {
                module: "master".to_string(),
                port: 0
            })
        );
        assert!(netlist.add_binding(ids[2], 0, ids[1], 0).is_err());
        // The failed attempt left the master port free.
        netlist.add_binding(ids[2], 0, ids[1], 1).unwrap();
    }

    #[test]
    fn test_cycle_rejected() {
        let (mut netlist, ids) = netlist(&["a", "b", "c"]);
        netlist.add_binding(ids[0], 0, ids[1], 0).unwrap();
        netlist.add_binding(ids[1], 0, ids[2], 0).unwrap();
        netlist.add_binding(ids[2], 0, ids[0], 0).unwrap();
        assert_eq!(
            netlist.check(),
            Err(Error::BindingCycle("a, b, c".to_string()))
        );
    }
}
