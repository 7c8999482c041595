use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

pub type TaskId = String;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    /// Task ids or provide tokens; a trailing `?` makes the dependency optional.
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

/// Tasks in the order they were added. Ordering ties are broken by that order.
#[derive(Debug, Default)]
pub struct Plan {
    tasks: Vec<Task>,
    index: BTreeMap<TaskId, usize>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.index.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, usize>> {
        let mut out: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), i) {
                    return Err(Error::msg(format!(
                        "provide token '{}' is produced by both '{}' and '{}'",
                        p, self.tasks[existing].id, task.id
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Resolves every `after` entry of every task to task indices.
    fn edges(&self) -> Result<Vec<Vec<usize>>> {
        let provides = self.provides_index()?;
        let mut deps = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let mut resolved = Vec::new();
            for dep in &task.after {
                let (name, optional) = dep
                    .strip_suffix('?')
                    .map(|d| (d, true))
                    .unwrap_or((dep.as_str(), false));
                let hit = self
                    .index
                    .get(name)
                    .copied()
                    .or_else(|| provides.get(name).copied());
                match hit {
                    Some(i) => resolved.push(i),
                    None if optional => {}
                    None => {
                        return Err(Error::msg(format!(
                            "task '{}' has invalid dependency '{}': unknown task or token",
                            task.id, dep
                        )));
                    }
                }
            }
            deps.push(resolved);
        }
        Ok(deps)
    }

    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let deps = self.edges()?;

        let mut incoming = vec![0usize; self.tasks.len()];
        let mut outgoing: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.tasks.len()];
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                if outgoing[d].insert(i) {
                    incoming[i] += 1;
                }
            }
        }

        // Always take the earliest-added ready task.
        let mut ready: BTreeSet<usize> = (0..self.tasks.len())
            .filter(|&i| incoming[i] == 0)
            .collect();
        let mut out = Vec::with_capacity(self.tasks.len());
        while let Some(n) = ready.pop_first() {
            out.push(&self.tasks[n]);
            for &m in &outgoing[n] {
                incoming[m] -= 1;
                if incoming[m] == 0 {
                    ready.insert(m);
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .enumerate()
                .filter_map(|(i, &c)| (c > 0).then_some(self.tasks[i].id.as_str()))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let deps = self.edges()?;

        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in &self.tasks {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                out.push_str(&format!(
                    "  \"{}\" -> \"{}\";\n",
                    self.tasks[d].id, self.tasks[i].id
                ));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}
