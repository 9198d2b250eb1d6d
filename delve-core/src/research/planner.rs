//! Planner: decompose a query into sub-questions and schedule them as a DAG.
//!
//! The generator proposes sub-questions and an advisory dependency map. The
//! map is cleaned (unknown ids and self-edges dropped), checked for cycles
//! and, if cyclic, discarded entirely. Scheduling is pure: Kahn's algorithm
//! for the execution order and longest-path levels for batching.

use super::session::QueryMode;
use super::structured::{complete_structured, prompt_safe};
use crate::error::PlanError;
use crate::generator::{CompletionOptions, TextGenerator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

/// How the dependency DAG affects execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagPolicy {
    /// Order and levels are computed and reported; all sub-questions run together.
    #[default]
    Informational,
    /// Search and synthesis run level by level, and dependents see their
    /// prerequisites' answers.
    Leveled,
}

/// One node of the plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubQuestion {
    /// `q1`, `q2`, ... in declaration order.
    pub id: String,
    pub text: String,
    /// Ids this question builds on. Empty after a cycle was discarded.
    pub depends_on: Vec<String>,
    /// Dependency level; roots are 0.
    pub level: u32,
}

/// A validated, scheduled plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    /// Sub-questions in declaration order.
    pub sub_questions: Vec<SubQuestion>,
    /// Topological execution order; a permutation of all ids.
    pub order: Vec<String>,
    /// Ids grouped by level, each group in execution order.
    pub levels: Vec<Vec<String>>,
    /// The generator's decomposition was unusable and the fixed skeleton was used.
    pub used_fallback_questions: bool,
    /// A dependency cycle was found and every edge was dropped.
    pub dependencies_discarded: bool,
    /// `(dependent, dependency)` edges dropped to stay within `max_depth` levels.
    #[serde(default)]
    pub pruned_dependencies: Vec<(String, String)>,
}

impl ExecutionPlan {
    pub fn get(&self, id: &str) -> Option<&SubQuestion> {
        self.sub_questions.iter().find(|q| q.id == id)
    }

    /// Sub-questions in execution order.
    pub fn ordered(&self) -> Vec<&SubQuestion> {
        self.order.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Sub-questions grouped by level, each group in execution order.
    pub fn ordered_levels(&self) -> Vec<Vec<&SubQuestion>> {
        self.levels
            .iter()
            .map(|level| level.iter().filter_map(|id| self.get(id)).collect())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sub_questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_questions.is_empty()
    }
}

/// Decomposes queries with a text generator and schedules the result.
pub struct QuestionPlanner {
    generator: Arc<dyn TextGenerator>,
}

impl QuestionPlanner {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// Produce a full execution plan. Never fails: unusable generator output
    /// degrades to the skeleton plan and cycles degrade to an edgeless plan.
    pub async fn plan(
        &self,
        query: &str,
        mode: QueryMode,
        max_depth: u32,
        focus_areas: &[String],
        warnings: &mut Vec<String>,
    ) -> ExecutionPlan {
        let count = mode.sub_question_count();
        let mut questions = self.decompose(query, mode, focus_areas, warnings).await;
        questions.truncate(count);

        let used_fallback_questions = questions.is_empty();
        let dependencies = if used_fallback_questions {
            warn!(query, "Decomposition unusable, using skeleton plan");
            warnings.push("planning: decomposition unusable, using skeleton plan".to_string());
            questions = skeleton_questions(query);
            BTreeMap::new()
        } else {
            self.dependencies(&questions, warnings).await
        };

        let (mut plan, cycle) = build_plan(questions, dependencies, max_depth);
        plan.used_fallback_questions = used_fallback_questions;
        if let Some(err) = cycle {
            warn!(error = %err, "Discarding dependency edges");
            warnings.push(format!("planning: {err}; dependency edges discarded"));
        }
        if !plan.pruned_dependencies.is_empty() {
            let edges: Vec<String> = plan
                .pruned_dependencies
                .iter()
                .map(|(id, dep)| format!("{id} -> {dep}"))
                .collect();
            warn!(max_depth, edges = ?edges, "Dependency edges exceed max depth");
            warnings.push(format!(
                "planning: dropped dependencies deeper than {max_depth} levels: {}",
                edges.join(", ")
            ));
        }
        info!(
            sub_questions = plan.len(),
            levels = plan.levels.len(),
            mode = %mode,
            "Plan ready"
        );
        plan
    }

    async fn decompose(
        &self,
        query: &str,
        mode: QueryMode,
        focus_areas: &[String],
        warnings: &mut Vec<String>,
    ) -> Vec<String> {
        let strategy = match mode {
            QueryMode::BreadthFirst => "Cover as many distinct angles of the topic as possible.",
            QueryMode::DepthFirst => "Build a chain of questions that go progressively deeper.",
            QueryMode::Hybrid => "Balance broad coverage with a few deeper follow-ups.",
        };
        let mut body = format!(
            "Break this research query into exactly {} specific, searchable sub-questions. {}\n",
            mode.sub_question_count(),
            strategy
        );
        if !focus_areas.is_empty() {
            let focus: Vec<String> = focus_areas.iter().map(|f| prompt_safe(f, 200)).collect();
            body.push_str(&format!("Make sure to cover: {}.\n", focus.join(", ")));
        }
        body.push_str(&format!(
            "Respond with JSON: {{\"sub_questions\": [\"...\", \"...\"]}}\n\nQuery: {}",
            prompt_safe(query, 2_000)
        ));

        let result = complete_structured::<Value>(
            self.generator.as_ref(),
            "decompose",
            &body,
            &CompletionOptions::json(),
        )
        .await;
        result
            .parsed("decompose", warnings)
            .map(|value| parse_questions(&value))
            .unwrap_or_default()
    }

    async fn dependencies(
        &self,
        questions: &[String],
        warnings: &mut Vec<String>,
    ) -> BTreeMap<String, Vec<String>> {
        let listing: Vec<String> = questions
            .iter()
            .enumerate()
            .map(|(i, q)| format!("q{}: {}", i + 1, prompt_safe(q, 500)))
            .collect();
        let body = format!(
            "For each sub-question, list the ids of the sub-questions whose answers it needs \
             first. Most questions need none. Respond with JSON: \
             {{\"dependencies\": {{\"q2\": [\"q1\"]}}}}\n\n{}",
            listing.join("\n")
        );
        let result = complete_structured::<Value>(
            self.generator.as_ref(),
            "dependencies",
            &body,
            &CompletionOptions::json(),
        )
        .await;
        result
            .parsed("dependencies", warnings)
            .map(|value| parse_dependencies(&value))
            .unwrap_or_default()
    }
}

/// The fixed four-question plan used when decomposition fails.
pub fn skeleton_questions(query: &str) -> Vec<String> {
    let topic = query.trim().trim_end_matches('?');
    vec![
        format!("What is {topic}?"),
        format!("Why does {topic} matter?"),
        format!("How does {topic} work?"),
        format!("What are the recent developments in {topic}?"),
    ]
}

/// Accepts `["..."]`, `{"sub_questions": [...]}` (or `subQuestions`,
/// `questions`), with items as strings or `{"question": "..."}` objects.
/// Blank and duplicate questions are dropped.
pub fn parse_questions(value: &Value) -> Vec<String> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match ["sub_questions", "subQuestions", "questions"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
        {
            Some(items) => items,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.as_str()),
            Value::Object(obj) => ["question", "text"]
                .iter()
                .find_map(|key| obj.get(*key).and_then(Value::as_str)),
            _ => None,
        })
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .filter(|q| seen.insert(q.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// Accepts `{"dependencies": {"q2": ["q1"]}}` or the bare map.
/// Non-string dependency entries are ignored.
pub fn parse_dependencies(value: &Value) -> BTreeMap<String, Vec<String>> {
    let map = match value.get("dependencies").unwrap_or(value) {
        Value::Object(map) => map,
        _ => return BTreeMap::new(),
    };
    map.iter()
        .map(|(id, deps)| {
            let deps = deps
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .map(|d| d.trim().to_string())
                        .collect()
                })
                .unwrap_or_default();
            (id.trim().to_string(), deps)
        })
        .collect()
}

/// Assign ids, clean the dependency map, validate it and schedule.
///
/// Returns the cycle error alongside the plan when edges had to be discarded.
pub fn build_plan(
    questions: Vec<String>,
    dependencies: BTreeMap<String, Vec<String>>,
    max_depth: u32,
) -> (ExecutionPlan, Option<PlanError>) {
    let ids: Vec<String> = (1..=questions.len()).map(|i| format!("q{i}")).collect();
    let mut deps = sanitize_dependencies(&ids, &dependencies);

    let cycle = validate_acyclic(&ids, &deps).err();
    if cycle.is_some() {
        deps.clear();
    }

    let order = topological_order(&ids, &deps);
    let pruned_dependencies = limit_depth(&order, &mut deps, max_depth);
    let level_of = dependency_levels(&order, &deps);

    let mut levels: Vec<Vec<String>> = Vec::new();
    for id in &order {
        let level = level_of.get(id).copied().unwrap_or(0) as usize;
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(id.clone());
    }

    let sub_questions = ids
        .iter()
        .zip(questions)
        .map(|(id, text)| SubQuestion {
            id: id.clone(),
            text,
            depends_on: deps.get(id).cloned().unwrap_or_default(),
            level: level_of.get(id).copied().unwrap_or(0),
        })
        .collect();

    let plan = ExecutionPlan {
        sub_questions,
        order,
        levels,
        used_fallback_questions: false,
        dependencies_discarded: cycle.is_some(),
        pruned_dependencies,
    };
    (plan, cycle)
}

/// Keep only edges between known ids, without self-edges or duplicates.
pub fn sanitize_dependencies(
    ids: &[String],
    dependencies: &BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, Vec<String>> {
    let known: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut clean = BTreeMap::new();
    for (id, deps) in dependencies {
        if !known.contains(id.as_str()) {
            continue;
        }
        let mut kept: Vec<String> = Vec::new();
        for dep in deps {
            if dep != id && known.contains(dep.as_str()) && !kept.contains(dep) {
                kept.push(dep.clone());
            }
        }
        if !kept.is_empty() {
            clean.insert(id.clone(), kept);
        }
    }
    clean
}

/// Kahn's algorithm, returning processed ids and the unprocessed remainder
/// (both in a deterministic order).
fn kahn(ids: &[String], deps: &BTreeMap<String, Vec<String>>) -> (Vec<String>, Vec<String>) {
    let index: HashMap<&str, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let mut in_degree = vec![0usize; ids.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];

    // Dependents lists are filled in declaration order.
    for (i, id) in ids.iter().enumerate() {
        for dep in deps.get(id).into_iter().flatten() {
            if let Some(&d) = index.get(dep.as_str()) {
                dependents[d].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..ids.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut processed = vec![false; ids.len()];
    let mut order = Vec::with_capacity(ids.len());
    while let Some(node) = queue.pop_front() {
        processed[node] = true;
        order.push(ids[node].clone());
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    let remaining = ids
        .iter()
        .enumerate()
        .filter(|(i, _)| !processed[*i])
        .map(|(_, id)| id.clone())
        .collect();
    (order, remaining)
}

/// Execution order over all `ids`: every id exactly once, dependencies
/// first. Ids stuck in a cycle are appended in declaration order.
pub fn topological_order(ids: &[String], deps: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let (mut order, remaining) = kahn(ids, deps);
    order.extend(remaining);
    order
}

/// Fails with the ids that could not be scheduled when the graph has a cycle.
pub fn validate_acyclic(
    ids: &[String],
    deps: &BTreeMap<String, Vec<String>>,
) -> Result<(), PlanError> {
    let (_, remaining) = kahn(ids, deps);
    if remaining.is_empty() {
        Ok(())
    } else {
        Err(PlanError::CycleDetected { nodes: remaining })
    }
}

/// Drop edges that would put a question at level `max_depth` or deeper, so
/// every kept dependency sits on a strictly lower level than its dependent.
/// Returns the dropped `(dependent, dependency)` pairs. `order` must be
/// topological.
pub fn limit_depth(
    order: &[String],
    deps: &mut BTreeMap<String, Vec<String>>,
    max_depth: u32,
) -> Vec<(String, String)> {
    let cap = max_depth.max(1) - 1;
    let mut levels: HashMap<String, u32> = HashMap::with_capacity(order.len());
    let mut pruned = Vec::new();
    for id in order {
        let mut level = 0;
        if let Some(ds) = deps.get_mut(id) {
            ds.retain(|dep| {
                let dep_level = levels.get(dep.as_str()).copied().unwrap_or(0);
                if dep_level >= cap {
                    pruned.push((id.clone(), dep.clone()));
                    false
                } else {
                    level = level.max(dep_level + 1);
                    true
                }
            });
            if ds.is_empty() {
                deps.remove(id);
            }
        }
        levels.insert(id.clone(), level);
    }
    pruned
}

/// Level of each id: roots are 0, others one more than their deepest
/// dependency. `order` must be topological.
pub fn dependency_levels(
    order: &[String],
    deps: &BTreeMap<String, Vec<String>>,
) -> HashMap<String, u32> {
    let mut levels: HashMap<String, u32> = HashMap::with_capacity(order.len());
    for id in order {
        let level = deps
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|dep| levels.get(dep))
            .map(|l| l + 1)
            .max()
            .unwrap_or(0);
        levels.insert(id.clone(), level);
    }
    levels
}
