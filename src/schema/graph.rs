//! Bidirectional foreign-key graph and join-path resolution.

use std::collections::{HashMap, HashSet, VecDeque};

use super::TableRelationship;

/// One side of a relationship as seen from a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub neighbor: String,
    pub relationship: TableRelationship,
}

/// A table brought into the query and the relationship used to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinStep {
    pub table: String,
    pub relationship: TableRelationship,
    /// Reached only as a stepping stone between requested tables.
    pub intermediate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinPlan {
    pub steps: Vec<JoinStep>,
    pub unreachable: Vec<String>,
}

/// Undirected adjacency over declared relationships. Neighbor order follows
/// declaration order, which keeps every traversal deterministic.
#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    adjacency: HashMap<String, Vec<GraphEdge>>,
}

impl RelationshipGraph {
    pub fn new(relationships: &[TableRelationship]) -> Self {
        let mut adjacency: HashMap<String, Vec<GraphEdge>> = HashMap::new();
        for rel in relationships {
            if rel.from_table == rel.to_table {
                continue;
            }
            adjacency
                .entry(rel.from_table.clone())
                .or_default()
                .push(GraphEdge {
                    neighbor: rel.to_table.clone(),
                    relationship: rel.clone(),
                });
            adjacency
                .entry(rel.to_table.clone())
                .or_default()
                .push(GraphEdge {
                    neighbor: rel.from_table.clone(),
                    relationship: rel.clone(),
                });
        }
        Self { adjacency }
    }

    /// Subgraph of every relationship with at least one endpoint in `tables`,
    /// so edges leading out to unrequested tables are kept.
    pub fn touching(relationships: &[TableRelationship], tables: &[String]) -> Self {
        let wanted: HashSet<&str> = tables.iter().map(String::as_str).collect();
        let touching: Vec<TableRelationship> = relationships
            .iter()
            .filter(|r| wanted.contains(r.from_table.as_str()) || wanted.contains(r.to_table.as_str()))
            .cloned()
            .collect();
        Self::new(&touching)
    }

    pub fn neighbors(&self, table: &str) -> &[GraphEdge] {
        self.adjacency.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Breadth-first shortest path. Each returned edge names the table it
    /// reaches, in order from `from` to `to`.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<GraphEdge>> {
        if from == to {
            return Some(Vec::new());
        }

        let mut parents: HashMap<String, (String, GraphEdge)> = HashMap::new();
        let mut visited: HashSet<String> = HashSet::from([from.to_string()]);
        let mut queue = VecDeque::from([from.to_string()]);

        while let Some(current) = queue.pop_front() {
            for edge in self.neighbors(&current) {
                if !visited.insert(edge.neighbor.clone()) {
                    continue;
                }
                parents.insert(edge.neighbor.clone(), (current.clone(), edge.clone()));
                if edge.neighbor == to {
                    let mut path = Vec::new();
                    let mut cursor = to.to_string();
                    while let Some((parent, edge)) = parents.remove(&cursor) {
                        path.push(edge);
                        cursor = parent;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(edge.neighbor.clone());
            }
        }
        None
    }

    /// Plans the joins that bring every requested table into a query rooted
    /// at `primary`.
    ///
    /// A breadth-first walk over `relationships` touching the request joins
    /// requested tables as they are reached and keeps expanding from them.
    /// Whatever that frontier misses is connected by a shortest path over the
    /// full graph (`self`), joining intermediates along the way.
    pub fn plan_joins(
        &self,
        relationships: &[TableRelationship],
        primary: &str,
        requested: &[String],
    ) -> JoinPlan {
        let wanted: HashSet<&str> = requested.iter().map(String::as_str).collect();
        let local = Self::touching(relationships, requested);

        let mut plan = JoinPlan::default();
        let mut joined: HashSet<String> = HashSet::from([primary.to_string()]);
        let mut queue = VecDeque::from([primary.to_string()]);

        while let Some(current) = queue.pop_front() {
            for edge in local.neighbors(&current) {
                if wanted.contains(edge.neighbor.as_str()) && joined.insert(edge.neighbor.clone()) {
                    plan.steps.push(JoinStep {
                        table: edge.neighbor.clone(),
                        relationship: edge.relationship.clone(),
                        intermediate: false,
                    });
                    queue.push_back(edge.neighbor.clone());
                }
            }
        }

        for target in requested {
            if joined.contains(target) {
                continue;
            }
            match self.shortest_path(primary, target) {
                Some(path) => {
                    for edge in path {
                        if joined.insert(edge.neighbor.clone()) {
                            let intermediate = !wanted.contains(edge.neighbor.as_str());
                            plan.steps.push(JoinStep {
                                table: edge.neighbor,
                                relationship: edge.relationship,
                                intermediate,
                            });
                        }
                    }
                }
                None => plan.unreachable.push(target.clone()),
            }
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rels() -> Vec<TableRelationship> {
        vec![
            TableRelationship::new("accounts", "employees", "assigned_to"),
            TableRelationship::new("sub_accounts", "accounts", "account_id"),
            TableRelationship::new("contacts", "sub_accounts", "sub_account_id"),
            TableRelationship::new("activities", "contacts", "contact_id"),
            TableRelationship::new("deals", "accounts", "account_id"),
        ]
    }

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn direct_neighbor_is_joined_in_first_pass() {
        let graph = RelationshipGraph::new(&rels());
        let plan = graph.plan_joins(&rels(), "accounts", &tables(&["accounts", "deals"]));
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].table, "deals");
        assert!(!plan.steps[0].intermediate);
    }

    #[test]
    fn intermediate_table_is_joined_through_path_search() {
        let graph = RelationshipGraph::new(&rels());
        let plan = graph.plan_joins(&rels(), "accounts", &tables(&["accounts", "contacts"]));
        let joined: Vec<&str> = plan.steps.iter().map(|s| s.table.as_str()).collect();
        assert_eq!(joined, vec!["sub_accounts", "contacts"]);
        assert!(plan.steps[0].intermediate);
        assert!(!plan.steps[1].intermediate);
        assert!(plan.unreachable.is_empty());
    }

    #[test]
    fn long_paths_use_the_full_graph() {
        let graph = RelationshipGraph::new(&rels());
        let plan = graph.plan_joins(&rels(), "deals", &tables(&["deals", "activities"]));
        let joined: Vec<&str> = plan.steps.iter().map(|s| s.table.as_str()).collect();
        assert_eq!(joined, vec!["accounts", "sub_accounts", "contacts", "activities"]);
    }

    #[test]
    fn disconnected_tables_are_reported() {
        let graph = RelationshipGraph::new(&rels());
        let plan = graph.plan_joins(&rels(), "accounts", &tables(&["accounts", "invoices"]));
        assert!(plan.steps.is_empty());
        assert_eq!(plan.unreachable, vec!["invoices".to_string()]);
    }

    #[test]
    fn shortest_path_walks_both_directions() {
        let graph = RelationshipGraph::new(&rels());
        let path = graph.shortest_path("employees", "contacts").unwrap();
        let hops: Vec<&str> = path.iter().map(|e| e.neighbor.as_str()).collect();
        assert_eq!(hops, vec!["accounts", "sub_accounts", "contacts"]);
    }
}
