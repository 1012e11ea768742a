use std::collections::{HashMap, HashSet};

/// `dependencies` maps each node to the nodes it waits on.
pub fn has_cycle(dependencies: &HashMap<String, Vec<String>>) -> bool {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    fn dfs<'a>(
        node: &'a str,
        dependencies: &'a HashMap<String, Vec<String>>,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> bool {
        if rec_stack.contains(node) {
            return true;
        }
        if visited.contains(node) {
            return false;
        }

        visited.insert(node);
        rec_stack.insert(node);

        if let Some(deps) = dependencies.get(node) {
            for dep in deps {
                if dfs(dep, dependencies, visited, rec_stack) {
                    return true;
                }
            }
        }

        rec_stack.remove(node);
        false
    }

    for node in dependencies.keys() {
        if !visited.contains(node.as_str()) && dfs(node, dependencies, &mut visited, &mut rec_stack) {
            return true;
        }
    }

    false
}
