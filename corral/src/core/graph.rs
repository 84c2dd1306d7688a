//! Dependency graph checks over task records.
//!
//! Parent/child links form a DAG (a forest, since each task has one parent
//! pointer); cycle creation is rejected at link time. Readiness and cluster
//! expansion are pure functions over an in-memory snapshot of the records.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::core::task::{TaskRecord, TaskStatus};

/// Snapshot of all task records, keyed by id.
pub type TaskIndex = BTreeMap<String, TaskRecord>;

/// True if making `child` a child of `parent` would create a cycle
/// (i.e. `child` is already an ancestor of `parent`, or is `parent` itself).
pub fn would_create_cycle(tasks: &TaskIndex, parent: &str, child: &str) -> bool {
    if parent == child {
        return true;
    }
    let mut cursor = Some(parent.to_string());
    let mut seen = BTreeSet::new();
    while let Some(id) = cursor {
        if id == child {
            return true;
        }
        // A malformed store could already contain a loop; stop rather than spin.
        if !seen.insert(id.clone()) {
            return true;
        }
        cursor = tasks.get(&id).and_then(|t| t.parent.clone());
    }
    false
}

/// Tasks in `todo` whose dependencies are satisfied, ordered by wave then
/// creation time then id.
///
/// A task's dependencies are its children: a decomposed parent is ready only
/// once every child is `validated`.
pub fn ready_tasks(tasks: &TaskIndex) -> Vec<&TaskRecord> {
    let mut ready: Vec<&TaskRecord> = tasks
        .values()
        .filter(|t| t.status == TaskStatus::Todo && t.owner.is_none())
        .filter(|t| {
            t.children.iter().all(|child| {
                tasks
                    .get(child)
                    .is_some_and(|c| c.status == TaskStatus::Validated)
            })
        })
        .collect();
    ready.sort_by(|a, b| {
        (a.wave, a.created_at, &a.id).cmp(&(b.wave, b.created_at, &b.id))
    });
    ready
}

/// The task plus all descendants, breadth-first, each id once.
pub fn hierarchy(tasks: &TaskIndex, root: &str) -> Vec<String> {
    expand(tasks, root, |t| t.children.iter())
}

/// The task plus the transitive closure of its explicit cluster links.
pub fn link_cluster(tasks: &TaskIndex, root: &str) -> Vec<String> {
    expand(tasks, root, |t| t.links.iter())
}

fn expand<'a, F, I>(tasks: &'a TaskIndex, root: &str, edges: F) -> Vec<String>
where
    F: Fn(&'a TaskRecord) -> I,
    I: Iterator<Item = &'a String>,
{
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([root.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(task) = tasks.get(&id) {
            for next in edges(task) {
                if !seen.contains(next) {
                    queue.push_back(next.clone());
                }
            }
        }
        out.push(id);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskKind;

    fn index(tasks: Vec<TaskRecord>) -> TaskIndex {
        tasks.into_iter().map(|t| (t.id.clone(), t)).collect()
    }

    fn task(id: &str, wave: u32) -> TaskRecord {
        TaskRecord::new(id, wave, TaskKind::Feature)
    }

    #[test]
    fn linking_ancestor_as_child_is_a_cycle() {
        let mut a = task("a", 0);
        let mut b = task("b", 0);
        b.parent = Some("a".to_string());
        a.children.insert("b".to_string());
        let tasks = index(vec![a, b, task("c", 0)]);

        assert!(would_create_cycle(&tasks, "b", "a"));
        assert!(would_create_cycle(&tasks, "a", "a"));
        assert!(!would_create_cycle(&tasks, "b", "c"));
    }

    #[test]
    fn ready_ordering_is_wave_then_creation() {
        let mut t1 = task("late", 1);
        t1.created_at = chrono::Utc::now();
        let t2 = task("w0", 0);
        let mut t3 = task("claimed", 0);
        t3.owner = Some("s1".to_string());
        let tasks = index(vec![t1, t2, t3]);

        let ids: Vec<&str> = ready_tasks(&tasks).iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["w0", "late"]);
    }

    #[test]
    fn parent_not_ready_until_children_validated() {
        let mut parent = task("parent", 0);
        parent.children.insert("child".to_string());
        let mut child = task("child", 0);
        let tasks = index(vec![parent.clone(), child.clone()]);
        assert!(ready_tasks(&tasks).iter().all(|t| t.id != "parent"));

        child.status = TaskStatus::Validated;
        let tasks = index(vec![parent, child]);
        let ids: Vec<&str> = ready_tasks(&tasks).iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["parent"]);
    }

    #[test]
    fn hierarchy_walks_descendants_once() {
        let mut root = task("root", 0);
        root.children.insert("a".to_string());
        root.children.insert("b".to_string());
        let mut a = task("a", 0);
        a.children.insert("a1".to_string());
        let tasks = index(vec![root, a, task("b", 0), task("a1", 0)]);

        let members = hierarchy(&tasks, "root");
        assert_eq!(members, vec!["root", "a", "b", "a1"]);
    }

    #[test]
    fn link_cluster_is_transitive_and_symmetric_by_storage() {
        let mut a = task("a", 0);
        a.links.insert("b".to_string());
        let mut b = task("b", 0);
        b.links.insert("a".to_string());
        b.links.insert("c".to_string());
        let mut c = task("c", 0);
        c.links.insert("b".to_string());
        let tasks = index(vec![a, b, c, task("d", 0)]);

        let cluster = link_cluster(&tasks, "a");
        assert_eq!(cluster, vec!["a", "b", "c"]);
    }
}
