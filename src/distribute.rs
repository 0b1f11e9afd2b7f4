use crate::models::{Agent, AgentRef, BatchId, Lead, LeadView};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Pair item `i` with `pool[i % pool.len()]`, keeping item order.
/// `None` when the pool is empty.
pub fn round_robin<T, A: Clone>(items: Vec<T>, pool: &[A]) -> Option<Vec<(T, A)>> {
    if pool.is_empty() {
        return None;
    }
    Some(
        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| (item, pool[i % pool.len()].clone()))
            .collect(),
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentDistribution {
    pub agent: AgentRef,
    pub leads: Vec<LeadView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReport {
    pub message: String,
    pub upload_batch: BatchId,
    pub distribution: Vec<AgentDistribution>,
}

impl DistributionReport {
    pub fn lead_total(&self) -> usize {
        self.distribution.iter().map(|d| d.leads.len()).sum()
    }
}

/// Group saved leads by owner. One entry per agent that got at least one
/// lead, in pool order; leads keep their persistence order.
pub fn build_report(
    batch: &BatchId,
    saved: &[Lead],
    pool: &[Agent],
    lookup: impl Fn(&Uuid) -> Option<Agent>,
) -> DistributionReport {
    let mut by_agent: HashMap<Uuid, Vec<&Lead>> = HashMap::new();
    for lead in saved {
        by_agent.entry(lead.agent).or_default().push(lead);
    }

    let distribution = pool
        .iter()
        .filter_map(|member| {
            let leads = by_agent.remove(&member.id)?;
            // Re-read: the agent may have been renamed or deleted since the
            // pool snapshot was taken.
            let agent = AgentRef::from(&lookup(&member.id)?);
            let leads = leads
                .into_iter()
                .map(|l| LeadView::new(l, Some(agent.clone())))
                .collect();
            Some(AgentDistribution { agent, leads })
        })
        .collect();

    DistributionReport {
        message: format!(
            "Successfully uploaded and distributed {} leads among {} agents",
            saved.len(),
            pool.len()
        ),
        upload_batch: batch.clone(),
        distribution,
    }
}
