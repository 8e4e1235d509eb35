//! Dependency resolver for stories.
//!
//! Stories are held in a petgraph `DiGraph` where an edge `A -> B` means
//! "A must complete before B can start". The resolver validates the graph
//! (missing ids, cycles) and partitions it into phases of mutually
//! independent stories.
//!
//! Phase grouping is O(V·(V+E)) in the worst case. Story sets per run are in
//! the tens, so this is not worth optimizing.

use crate::core::story::{Story, StoryId};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// An ordered group of stories whose dependencies are all satisfied by
/// earlier phases. Within a phase, order is the input order.
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    /// Zero-based position of this phase in the run.
    pub index: usize,
    pub stories: Vec<Story>,
}

impl Phase {
    pub fn ids(&self) -> Vec<StoryId> {
        self.stories.iter().map(|s| s.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.stories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stories.is_empty()
    }
}

/// A defect found while validating a story set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyIssue {
    /// `story` declares a dependency on an id that is not in the set.
    Missing { story: StoryId, dependency: StoryId },
    /// The same id appears more than once in the input.
    Duplicate { story: StoryId },
    /// A dependency cycle, listed in traversal order and closed on its start.
    Cycle { path: Vec<StoryId> },
}

impl From<DependencyIssue> for Error {
    fn from(issue: DependencyIssue) -> Self {
        match issue {
            DependencyIssue::Missing { story, dependency } => {
                Error::MissingDependency { story, dependency }
            }
            DependencyIssue::Duplicate { story } => {
                Error::Validation(format!("story '{}' appears more than once", story))
            }
            DependencyIssue::Cycle { path } => Error::DependencyCycle { path },
        }
    }
}

/// The story dependency graph.
pub struct StoryGraph {
    graph: DiGraph<Story, ()>,
    index: HashMap<StoryId, NodeIndex>,
    missing: Vec<(StoryId, StoryId)>,
    duplicates: Vec<StoryId>,
}

impl StoryGraph {
    /// Build the graph from a story set.
    ///
    /// Dependencies on unknown ids are recorded rather than rejected so that
    /// validation can report every one of them.
    pub fn build(stories: &[Story]) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut duplicates = Vec::new();

        for story in stories {
            if index.contains_key(&story.id) {
                duplicates.push(story.id.clone());
                continue;
            }
            let node = graph.add_node(story.clone());
            index.insert(story.id.clone(), node);
        }

        let mut missing = Vec::new();
        for node in graph.node_indices().collect::<Vec<_>>() {
            let deps = graph[node].dependencies.clone();
            for dep in deps {
                match index.get(&dep) {
                    Some(&from) => {
                        if graph.find_edge(from, node).is_none() {
                            graph.add_edge(from, node, ());
                        }
                    }
                    None => missing.push((graph[node].id.clone(), dep)),
                }
            }
        }

        Self {
            graph,
            index,
            missing,
            duplicates,
        }
    }

    pub fn story_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn get(&self, id: &StoryId) -> Option<&Story> {
        self.index.get(id).map(|&n| &self.graph[n])
    }

    /// Missing-dependency and duplicate-id issues, in input order.
    fn structural_issues(&self) -> Vec<DependencyIssue> {
        let mut issues: Vec<DependencyIssue> = self
            .duplicates
            .iter()
            .map(|id| DependencyIssue::Duplicate { story: id.clone() })
            .collect();
        issues.extend(
            self.missing
                .iter()
                .map(|(story, dependency)| DependencyIssue::Missing {
                    story: story.clone(),
                    dependency: dependency.clone(),
                }),
        );
        issues
    }

    /// Partition the graph into phases.
    ///
    /// # Errors
    /// Returns the first structural issue if any exist, otherwise a
    /// `DependencyCycle` error naming the exact cycle when grouping stalls.
    pub fn phases(&self) -> Result<Vec<Phase>> {
        if let Some(issue) = self.structural_issues().into_iter().next() {
            return Err(issue.into());
        }

        let mut completed: HashSet<NodeIndex> = HashSet::new();
        let mut remaining: Vec<NodeIndex> = self.graph.node_indices().collect();
        let mut phases = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<NodeIndex> = remaining
                .iter()
                .copied()
                .filter(|&node| {
                    self.graph
                        .neighbors_directed(node, Direction::Incoming)
                        .all(|dep| completed.contains(&dep))
                })
                .collect();

            if ready.is_empty() {
                let path = self.cycle_among(&remaining).unwrap_or_else(|| {
                    remaining.iter().map(|&n| self.graph[n].id.clone()).collect()
                });
                return Err(Error::DependencyCycle { path });
            }

            completed.extend(ready.iter().copied());
            remaining.retain(|node| !completed.contains(node));
            phases.push(Phase {
                index: phases.len(),
                stories: ready.iter().map(|&n| self.graph[n].clone()).collect(),
            });
        }

        Ok(phases)
    }

    /// Find the first cycle reachable among all stories, if any.
    pub fn find_cycle(&self) -> Option<Vec<StoryId>> {
        let all: Vec<NodeIndex> = self.graph.node_indices().collect();
        self.cycle_among(&all)
    }

    /// Depth-first search with an explicit stack over `nodes`, following each
    /// story's declared dependency order. The first back-edge gives the cycle.
    fn cycle_among(&self, nodes: &[NodeIndex]) -> Option<Vec<StoryId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            OnStack,
            Done,
        }

        let scope: HashSet<NodeIndex> = nodes.iter().copied().collect();
        let mut marks: HashMap<NodeIndex, Mark> = HashMap::new();

        for &root in nodes {
            if marks.contains_key(&root) {
                continue;
            }
            // (node, position of the next dependency to explore)
            let mut stack: Vec<(NodeIndex, usize)> = vec![(root, 0)];
            marks.insert(root, Mark::OnStack);

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                let deps = &self.graph[node].dependencies;
                if frame.1 >= deps.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                }
                let dep_id = &deps[frame.1];
                frame.1 += 1;

                let Some(&dep) = self.index.get(dep_id) else {
                    continue;
                };
                if !scope.contains(&dep) {
                    continue;
                }
                match marks.get(&dep) {
                    Some(Mark::OnStack) => {
                        let start = stack.iter().position(|&(n, _)| n == dep)?;
                        let mut path: Vec<StoryId> = stack[start..]
                            .iter()
                            .map(|&(n, _)| self.graph[n].id.clone())
                            .collect();
                        path.push(self.graph[dep].id.clone());
                        return Some(path);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(dep, Mark::OnStack);
                        stack.push((dep, 0));
                    }
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for StoryGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoryGraph")
            .field("stories", &self.story_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

/// Validate a story set.
///
/// Missing dependencies (and duplicate ids) are reported first. Cycle
/// detection only runs when there are none, so a mistyped id is never
/// reported as a confusing cycle.
pub fn validate_dependencies(stories: &[Story]) -> Vec<DependencyIssue> {
    let graph = StoryGraph::build(stories);
    let issues = graph.structural_issues();
    if !issues.is_empty() {
        return issues;
    }
    match graph.find_cycle() {
        Some(path) => vec![DependencyIssue::Cycle { path }],
        None => Vec::new(),
    }
}

/// Partition stories into dependency-ordered phases.
pub fn group_stories_by_phase(stories: &[Story]) -> Result<Vec<Phase>> {
    StoryGraph::build(stories).phases()
}
