//! Community detection over the entity graph.
//!
//! Louvain modularity clustering with a deterministic seed, followed by LLM
//! summarization and embedding of each surviving community. The stored
//! community set is replaced atomically on every rebuild.

use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CommunityConfig;
use crate::embeddings::VoyageEmbedder;
use crate::error::Result;
use crate::llm::MessagesClient;
use crate::memory::CommunityRebuild;
use crate::store::{CommunityRecord, EntityNode, GraphStore, RelationshipEdge};

const LOUVAIN_SEED: u64 = 42;

const SUMMARY_PROMPT: &str = "\
You are summarizing a group of related entities from a personal assistant's memory.
These entities were found to form a community (cluster) in the user's knowledge graph.

Given the entities and their descriptions below, write a concise summary (2-3 sentences)
that captures what this group represents and why these entities are related.
The summary should be useful as context for future conversations.

Entities may be in Korean or English. Write the summary in the same language as the majority of entities.
If mixed, prefer Korean.

Entities:
{entity_list}

Write ONLY the summary, no preamble or formatting.";

/// Build the node list and aggregated undirected edge list from stored
/// entities and relationships. Multiple relationships between the same
/// endpoints sum their weights; edges touching unknown entities are dropped.
pub fn aggregate_edges(
    entities: &[EntityNode],
    relationships: &[RelationshipEdge],
) -> (Vec<Uuid>, Vec<(usize, usize, f64)>) {
    let nodes: Vec<Uuid> = entities.iter().map(|e| e.id).collect();
    let index: HashMap<Uuid, usize> = nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut weights: HashMap<(usize, usize), f64> = HashMap::new();
    for rel in relationships {
        let (Some(&a), Some(&b)) = (index.get(&rel.source_id), index.get(&rel.target_id)) else {
            continue;
        };
        if a == b {
            continue;
        }
        let key = (a.min(b), a.max(b));
        *weights.entry(key).or_insert(0.0) += rel.weight;
    }

    let mut edges: Vec<(usize, usize, f64)> = weights
        .into_iter()
        .map(|((a, b), w)| (a, b, w))
        .collect();
    edges.sort_by(|x, y| (x.0, x.1).cmp(&(y.0, y.1)));
    (nodes, edges)
}

/// Louvain community detection on an undirected weighted graph.
///
/// Returns communities as sets of original node indices. Deterministic for a
/// given seed: node visit order is the only randomized element.
pub fn louvain(node_count: usize, edges: &[(usize, usize, f64)], seed: u64) -> Vec<Vec<usize>> {
    if node_count == 0 {
        return Vec::new();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    // membership[i] = community of original node i, refined level by level.
    let mut membership: Vec<usize> = (0..node_count).collect();
    let mut level_nodes = node_count;
    let mut level_edges: Vec<(usize, usize, f64)> = edges.to_vec();

    loop {
        let (assignment, improved) = one_level(level_nodes, &level_edges, &mut rng);
        if !improved {
            break;
        }

        // Renumber communities densely.
        let mut renumber: HashMap<usize, usize> = HashMap::new();
        for &c in &assignment {
            let next = renumber.len();
            renumber.entry(c).or_insert(next);
        }
        let compact: Vec<usize> = assignment.iter().map(|c| renumber[c]).collect();

        for m in &mut membership {
            *m = compact[*m];
        }

        // Aggregate the graph for the next level.
        let mut weights: HashMap<(usize, usize), f64> = HashMap::new();
        for &(u, v, w) in &level_edges {
            let (cu, cv) = (compact[u], compact[v]);
            let key = (cu.min(cv), cu.max(cv));
            *weights.entry(key).or_insert(0.0) += w;
        }
        let next_nodes = renumber.len();
        if next_nodes == level_nodes {
            break;
        }
        level_nodes = next_nodes;
        level_edges = weights.into_iter().map(|((u, v), w)| (u, v, w)).collect();
        level_edges.sort_by(|x, y| (x.0, x.1).cmp(&(y.0, y.1)));
    }

    let community_count = membership.iter().copied().max().map_or(0, |m| m + 1);
    let mut communities = vec![Vec::new(); community_count];
    for (node, &community) in membership.iter().enumerate() {
        communities[community].push(node);
    }
    communities.retain(|c| !c.is_empty());
    communities
}

/// One local-moving phase. Returns `(assignment, improved)`.
fn one_level(
    node_count: usize,
    edges: &[(usize, usize, f64)],
    rng: &mut StdRng,
) -> (Vec<usize>, bool) {
    let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); node_count];
    let mut self_loops = vec![0.0f64; node_count];
    for &(u, v, w) in edges {
        if u == v {
            self_loops[u] += w;
        } else {
            adjacency[u].push((v, w));
            adjacency[v].push((u, w));
        }
    }

    let degree: Vec<f64> = (0..node_count)
        .map(|i| adjacency[i].iter().map(|&(_, w)| w).sum::<f64>() + 2.0 * self_loops[i])
        .collect();
    let two_m: f64 = degree.iter().sum();
    if two_m <= 0.0 {
        return ((0..node_count).collect(), false);
    }

    let mut community: Vec<usize> = (0..node_count).collect();
    let mut community_total = degree.clone();

    let mut order: Vec<usize> = (0..node_count).collect();
    order.shuffle(rng);

    let mut improved = false;
    loop {
        let mut moved = 0usize;
        for &node in &order {
            let current = community[node];
            community_total[current] -= degree[node];

            // Weight from `node` into each neighboring community.
            let mut links: HashMap<usize, f64> = HashMap::new();
            links.insert(current, 0.0);
            for &(neighbor, w) in &adjacency[node] {
                *links.entry(community[neighbor]).or_insert(0.0) += w;
            }

            let mut best = current;
            let mut best_gain = links[&current] - community_total[current] * degree[node] / two_m;
            for (&candidate, &w_in) in &links {
                let gain = w_in - community_total[candidate] * degree[node] / two_m;
                if gain > best_gain + 1e-12 {
                    best = candidate;
                    best_gain = gain;
                }
            }

            community_total[best] += degree[node];
            if best != current {
                community[node] = best;
                moved += 1;
            }
        }
        if moved == 0 {
            break;
        }
        improved = true;
    }

    (community, improved)
}

/// Detects communities in the entity graph and stores their summaries.
pub struct CommunityDetector {
    store: GraphStore,
    embedder: VoyageEmbedder,
    llm: MessagesClient,
    config: CommunityConfig,
}

impl CommunityDetector {
    pub fn new(
        store: GraphStore,
        embedder: VoyageEmbedder,
        llm: MessagesClient,
        config: CommunityConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            embedder,
            llm,
            config,
        })
    }

    async fn summarize(&self, members: &[&EntityNode]) -> String {
        let entity_list = members
            .iter()
            .map(|e| format!("- {} ({}): {}", e.name, e.entity_type, e.description))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = SUMMARY_PROMPT.replace("{entity_list}", &entity_list);
        match self.llm.complete(None, &prompt).await {
            Ok(summary) => summary.trim().to_owned(),
            Err(e) => {
                warn!("community summarization failed: {e}");
                let names = members
                    .iter()
                    .take(5)
                    .map(|e| e.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("Group related to: {names}")
            }
        }
    }
}

#[async_trait]
impl CommunityRebuild for CommunityDetector {
    /// Full rebuild: detect, summarize, embed, save. Returns the number of
    /// communities stored. Below `community_min_entities` nothing is
    /// touched; an empty detection result clears stale data.
    async fn rebuild(&self) -> Result<usize> {
        let entity_count = self.store.get_entity_count().await?;
        if (entity_count as usize) < self.config.community_min_entities {
            debug!(
                count = entity_count,
                min = self.config.community_min_entities,
                "too few entities for community detection"
            );
            return Ok(0);
        }

        let (entities, relationships) = self.store.load_graph().await?;
        if entities.is_empty() {
            return Ok(0);
        }

        let (nodes, edges) = aggregate_edges(&entities, &relationships);
        if nodes.len() < 2 {
            self.store.rebuild_communities(&[]).await?;
            info!("no communities detected, cleared stale data");
            return Ok(0);
        }

        let by_id: HashMap<Uuid, &EntityNode> = entities.iter().map(|e| (e.id, e)).collect();
        let partitions: Vec<Vec<usize>> = louvain(nodes.len(), &edges, LOUVAIN_SEED)
            .into_iter()
            .filter(|p| p.len() >= 2)
            .collect();

        let mut communities = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            let members: Vec<&EntityNode> = partition
                .iter()
                .filter_map(|&i| by_id.get(&nodes[i]).copied())
                .collect();
            if members.len() < 2 {
                continue;
            }
            let summary = self.summarize(&members).await;
            let embedding = self
                .embedder
                .embed_chunks_contextual(std::slice::from_ref(&summary))
                .await?
                .into_iter()
                .next()
                .unwrap_or_default();
            communities.push(CommunityRecord {
                summary,
                summary_embedding: embedding,
                entity_ids: members.iter().map(|e| e.id).collect(),
            });
        }

        self.store.rebuild_communities(&communities).await?;
        if communities.is_empty() {
            info!("no communities detected, cleared stale data");
        } else {
            info!(
                count = communities.len(),
                total_entities = communities.iter().map(|c| c.entity_ids.len()).sum::<usize>(),
                "communities rebuilt"
            );
        }
        Ok(communities.len())
    }
}
