use crate::config::ProjectConfig;
use crate::errors::{AppError, AppResult};
use std::collections::{HashMap, HashSet};

/// Groups `selected` into dependency layers; every project's dependencies sit in earlier layers.
///
/// Dependencies on configured but unselected projects are ignored. Names missing from
/// `known` and cycles are configuration errors, reported before anything runs.
pub fn layers(selected: &[ProjectConfig], known: &HashSet<&str>) -> AppResult<Vec<Vec<ProjectConfig>>> {
    let index: HashMap<&str, usize> = selected
        .iter()
        .enumerate()
        .map(|(position, project)| (project.name.as_str(), position))
        .collect();

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); selected.len()];
    let mut indegree: Vec<usize> = vec![0; selected.len()];
    for (position, project) in selected.iter().enumerate() {
        for dependency in &project.depends_on {
            if !known.contains(dependency.as_str()) {
                return Err(AppError::Config(format!(
                    "project '{}' depends on unknown project '{}'",
                    project.name, dependency
                )));
            }
            let Some(&upstream) = index.get(dependency.as_str()) else {
                continue;
            };
            if upstream == position {
                return Err(AppError::Config(format!("project '{}' depends on itself", project.name)));
            }
            dependents[upstream].push(position);
            indegree[position] += 1;
        }
    }

    let mut ready: Vec<usize> = (0..selected.len()).filter(|&node| indegree[node] == 0).collect();
    let mut placed = 0;
    let mut result = Vec::new();
    while !ready.is_empty() {
        ready.sort_by(|a, b| selected[*a].name.cmp(&selected[*b].name));
        let mut next = Vec::new();
        for &node in &ready {
            for &dependent in &dependents[node] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        placed += ready.len();
        result.push(ready.iter().map(|&node| selected[node].clone()).collect());
        ready = next;
    }

    if placed < selected.len() {
        let mut stuck: Vec<&str> = (0..selected.len())
            .filter(|&node| indegree[node] > 0)
            .map(|node| selected[node].name.as_str())
            .collect();
        stuck.sort_unstable();
        return Err(AppError::Config(format!("dependency cycle among projects: {}", stuck.join(", "))));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::layers;
    use crate::config::{EnvPolicy, ProjectConfig};
    use std::collections::HashSet;

    fn project(name: &str, deps: &[&str]) -> ProjectConfig {
        ProjectConfig {
            name: name.to_string(),
            path: name.to_string(),
            provider: "noop".to_string(),
            env_file_preview: None,
            env_file_prod: None,
            build_command: None,
            tags: Vec::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            policy: EnvPolicy::default(),
        }
    }

    fn names(layers: &[Vec<ProjectConfig>]) -> Vec<Vec<&str>> {
        layers
            .iter()
            .map(|layer| layer.iter().map(|p| p.name.as_str()).collect())
            .collect()
    }

    #[test]
    fn layers_follow_dependencies() {
        let selected = vec![
            project("web", &["api", "ui"]),
            project("ui", &[]),
            project("api", &["db"]),
            project("db", &[]),
        ];
        let known: HashSet<&str> = ["web", "ui", "api", "db"].into_iter().collect();
        let result = layers(&selected, &known).expect("acyclic");
        assert_eq!(names(&result), vec![vec!["db", "ui"], vec!["api"], vec!["web"]]);
    }

    #[test]
    fn unselected_dependencies_are_ignored() {
        let selected = vec![project("web", &["api"])];
        let known: HashSet<&str> = ["web", "api"].into_iter().collect();
        let result = layers(&selected, &known).expect("api not selected");
        assert_eq!(names(&result), vec![vec!["web"]]);
    }

    #[test]
    fn cycles_and_unknown_names_fail() {
        let selected = vec![project("a", &["b"]), project("b", &["c"]), project("c", &["a"]), project("d", &[])];
        let known: HashSet<&str> = ["a", "b", "c", "d"].into_iter().collect();
        let err = layers(&selected, &known).expect_err("cycle");
        assert_eq!(err.to_string(), "CONFIG_INVALID: dependency cycle among projects: a, b, c");

        let err = layers(&[project("a", &["ghost"])], &["a"].into_iter().collect()).expect_err("unknown");
        assert!(err.to_string().contains("unknown project 'ghost'"));
    }
}
