use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::{MetadataCommand, PackageId};

struct BoundaryRule {
    package: &'static str,
    forbidden: &'static [&'static str],
}

// The recipient client must stay deployable without the server stack, and
// the wire-contract crate must not grow runtime dependencies.
const RULES: &[BoundaryRule] = &[
    BoundaryRule {
        package: "lista-client",
        forbidden: &["axum", "lista-gateway", "lista-store", "sqlx"],
    },
    BoundaryRule {
        package: "lista-contracts",
        forbidden: &["axum", "reqwest", "sqlx", "tokio"],
    },
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let id_to_name: HashMap<_, _> = metadata
        .packages
        .iter()
        .map(|p| (p.id.clone(), p.name.as_str()))
        .collect();

    let adjacency: HashMap<_, _> = resolve
        .nodes
        .iter()
        .map(|node| {
            let deps: Vec<_> = node.deps.iter().map(|dep| dep.pkg.clone()).collect();
            (node.id.clone(), deps)
        })
        .collect();

    let mut failed = false;
    for rule in RULES {
        let package = metadata
            .packages
            .iter()
            .find(|p| p.name == rule.package)
            .with_context(|| format!("package `{}` not found in workspace", rule.package))?;

        let violations =
            transitive_violations(&package.id, &adjacency, &id_to_name, rule.forbidden);

        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                rule.package,
                rule.forbidden.join(", ")
            );
        } else {
            failed = true;
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                rule.package,
                violations.join(", ")
            );
        }
    }

    if failed {
        std::process::exit(1);
    }

    Ok(())
}

fn transitive_violations(
    start: &PackageId,
    adjacency: &HashMap<PackageId, Vec<PackageId>>,
    id_to_name: &HashMap<PackageId, &str>,
    forbidden: &[&str],
) -> Vec<String> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(start.clone());
    visited.insert(start.clone());

    let mut violations = Vec::new();

    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(&current) else {
            continue;
        };

        for dep in deps.iter().cloned() {
            if !visited.insert(dep.clone()) {
                continue;
            }

            if let Some(name) = id_to_name.get(&dep)
                && forbidden.contains(name)
            {
                violations.push((*name).to_string());
            }

            queue.push_back(dep);
        }
    }

    violations.sort();
    violations.dedup();
    violations
}
