//! Cluster and attribute discovery of remote endpoints.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use futures_util::{future::join_all, stream::FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    af::Af,
    endpoint::Endpoint,
    error::{self, AfError},
    frame::{ReadRecord, ZclPayload},
    zcl::ZclConfig,
};

pub const DIR_IN: u8 = 0x01;
pub const DIR_OUT: u8 = 0x02;

const BASIC_CLUSTER: u16 = 0x0000;

/// Attribute values by attribute name (decimal id when the name is unknown).
pub type AttrMap = BTreeMap<String, serde_json::Value>;

/// Interview result by cluster name (decimal id when the name is unknown).
pub type ClusterMap = BTreeMap<String, ClusterRecord>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: u16,
    /// [DIR_IN] and/or [DIR_OUT]
    pub dir: u8,
    pub attrs: AttrMap,
    pub index: usize,
    /// last failure, cleared once a retry succeeds
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterviewProgress {
    pub endpoint: u8,
    pub total: usize,
    pub current: usize,
    pub cluster_id: u16,
    pub attrs: AttrMap,
    pub error: Option<String>,
}

/// Clusters to interview.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Interest {
    #[default]
    All,
    /// only the named clusters; `false` probes attribute ids without reading values
    Clusters(BTreeMap<String, bool>),
}

impl Interest {
    fn includes(&self, cluster: &str) -> bool {
        match self {
            Interest::All => true,
            Interest::Clusters(m) => m.contains_key(cluster),
        }
    }

    fn wants_values(&self, cluster: &str) -> bool {
        match self {
            Interest::All => true,
            Interest::Clusters(m) => m.get(cluster).copied().unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InterviewConfig {
    pub progress: Option<mpsc::UnboundedSender<InterviewProgress>>,
    pub interest: Interest,
}

impl Af {
    fn cluster_key(&self, cluster_id: u16) -> String {
        self.codec
            .cluster_name(cluster_id)
            .unwrap_or_else(|| cluster_id.to_string())
    }

    /// Page through the attribute ids the endpoint reports for a cluster.
    pub async fn discover_attr_ids(
        &self,
        ep: &Arc<dyn Endpoint>,
        cluster_id: u16,
    ) -> Result<Vec<u16>> {
        let mut ids: Vec<u16> = Vec::new();
        let mut start_attr_id = 0u16;
        loop {
            let payload = ZclPayload::Discover {
                start_attr_id,
                max_attr_ids: self.config.discover_page_size,
            };
            let rsp = self
                .zcl_foundation(ep, ep, cluster_id, "discover", payload, ZclConfig::default())
                .await?
                .ok_or_else(|| AfError::UnexpectedResponse("discover without response".into()))?;
            let ZclPayload::DiscoverRsp {
                disc_complete,
                attr_infos,
            } = rsp.payload
            else {
                return Err(AfError::UnexpectedResponse(format!(
                    "{} to discover of cluster {}",
                    rsp.cmd_id, cluster_id
                ))
                .into());
            };

            for info in &attr_infos {
                if !ids.contains(&info.attr_id) {
                    ids.push(info.attr_id);
                }
            }
            if disc_complete {
                break;
            }
            match attr_infos.last() {
                Some(last) if last.attr_id < u16::MAX => start_attr_id = last.attr_id + 1,
                _ => break,
            }
        }
        log::trace!("cluster {} attributes {:?}", cluster_id, ids);
        Ok(ids)
    }

    async fn read_attrs(
        &self,
        ep: &Arc<dyn Endpoint>,
        cluster_id: u16,
        attr_ids: Vec<u16>,
    ) -> Result<Vec<ReadRecord>> {
        let rsp = self
            .zcl_foundation(
                ep,
                ep,
                cluster_id,
                "read",
                ZclPayload::Read(attr_ids),
                ZclConfig::default(),
            )
            .await?
            .ok_or_else(|| AfError::UnexpectedResponse("read without response".into()))?;
        match rsp.payload {
            ZclPayload::ReadRsp(records) => Ok(records),
            _ => Err(AfError::UnexpectedResponse(format!(
                "{} to read of cluster {}",
                rsp.cmd_id, cluster_id
            ))
            .into()),
        }
    }

    /// Read one chunk, falling back to single attribute reads when the chunk fails.
    async fn read_chunk(
        &self,
        ep: &Arc<dyn Endpoint>,
        cluster_id: u16,
        chunk: &[u16],
    ) -> Vec<ReadRecord> {
        let device = ep.ieee_addr();
        let err = match self
            .limiter
            .run(device, self.read_attrs(ep, cluster_id, chunk.to_vec()))
            .await
        {
            Ok(records) => return records,
            Err(e) => e,
        };
        log::debug!(
            "chunk read of cluster {} failed, reading individually: {:#}",
            cluster_id,
            err
        );

        let mut records = Vec::new();
        for attr_id in chunk {
            match self
                .limiter
                .run(device, self.read_attrs(ep, cluster_id, vec![*attr_id]))
                .await
            {
                Ok(r) => records.extend(r),
                Err(e) => log::debug!(
                    "read of cluster {} attr {} failed: {:#}",
                    cluster_id,
                    attr_id,
                    e
                ),
            }
        }
        records
    }

    /// Discover and read the attributes of one cluster. With `interested` false only ids are probed.
    pub async fn read_cluster_attrs(
        &self,
        ep: &Arc<dyn Endpoint>,
        cluster_id: u16,
        interested: bool,
    ) -> Result<AttrMap> {
        let attr_ids = self
            .limiter
            .run(ep.ieee_addr(), self.discover_attr_ids(ep, cluster_id))
            .await?;

        let attr_key = |attr_id: u16| {
            self.codec
                .attr_name(cluster_id, attr_id)
                .unwrap_or_else(|| attr_id.to_string())
        };

        let mut attrs = AttrMap::new();
        if !interested {
            for attr_id in attr_ids {
                attrs.insert(attr_key(attr_id), serde_json::Value::Null);
            }
            return Ok(attrs);
        }

        let chunk_size = self.config.read_chunk_size.max(1);
        let reads = attr_ids
            .chunks(chunk_size)
            .map(|chunk| self.read_chunk(ep, cluster_id, chunk));
        for records in join_all(reads).await {
            for rec in records {
                let value = if error::status_ok(rec.status) {
                    rec.attr_data
                } else {
                    serde_json::Value::Null
                };
                attrs.insert(attr_key(rec.attr_id), value);
            }
        }
        Ok(attrs)
    }

    /// Interview every advertised cluster of `ep` selected by the interest set.
    ///
    /// The first cluster goes alone, the rest concurrently. Failed clusters are then retried
    /// one at a time for as long as a retry round makes progress.
    pub async fn interview_clusters(
        &self,
        ep: &Arc<dyn Endpoint>,
        cfg: InterviewConfig,
    ) -> Result<ClusterMap> {
        let in_clusters = ep.in_clusters();
        let out_clusters = ep.out_clusters();
        let dir_of = |id: u16| {
            let mut dir = 0;
            if in_clusters.contains(&id) {
                dir |= DIR_IN;
            }
            if out_clusters.contains(&id) {
                dir |= DIR_OUT;
            }
            dir
        };

        let cluster_ids: Vec<u16> = ep
            .clusters()
            .into_iter()
            .filter(|id| cfg.interest.includes(&self.cluster_key(*id)))
            .collect();
        let total = cluster_ids.len();
        let mut clusters = ClusterMap::new();
        let Some((first, rest)) = cluster_ids.split_first() else {
            return Ok(clusters);
        };

        let report = |record: &ClusterRecord| {
            if let Some(progress) = &cfg.progress {
                let _ = progress.send(InterviewProgress {
                    endpoint: ep.ep_id(),
                    total,
                    current: record.index,
                    cluster_id: record.id,
                    attrs: record.attrs.clone(),
                    error: record.error.clone(),
                });
            }
        };
        let attempt = |id: u16| {
            let key = self.cluster_key(id);
            let interested = cfg.interest.wants_values(&key);
            async move { (key, id, self.read_cluster_attrs(ep, id, interested).await) }
        };

        let mut current = 0;
        let mut first_pass = FuturesUnordered::new();
        first_pass.push(attempt(*first));
        while let Some(outcome) = first_pass.next().await {
            if first_pass.is_empty() && current == 0 {
                first_pass.extend(rest.iter().map(|id| attempt(*id)));
            }
            current += 1;
            let (key, id, result) = outcome;
            let (attrs, error) = match result {
                Ok(attrs) => (attrs, None),
                Err(e) => {
                    log::debug!("interview of cluster {} failed: {:#}", key, e);
                    (AttrMap::new(), Some(format!("{:#}", e)))
                }
            };
            let record = ClusterRecord {
                id,
                dir: dir_of(id),
                attrs,
                index: current,
                error,
            };
            report(&record);
            clusters.insert(key, record);
        }

        let mut iteration = 0;
        loop {
            let failing: Vec<String> = clusters
                .iter()
                .filter(|(_, r)| r.error.is_some())
                .map(|(k, _)| k.clone())
                .collect();
            if failing.is_empty() {
                break;
            }
            iteration += 1;
            log::debug!(
                "interview retry iteration {} for 0x{:016x}: {:?}",
                iteration,
                ep.ieee_addr(),
                failing
            );

            let mut completed_any = false;
            let mut remaining_errors = false;
            for key in failing {
                let Some(record) = clusters.get_mut(&key) else {
                    continue;
                };
                let interested = cfg.interest.wants_values(&key);
                match self.read_cluster_attrs(ep, record.id, interested).await {
                    Ok(attrs) => {
                        record.attrs = attrs;
                        record.error = None;
                        completed_any = true;
                    }
                    Err(e) => {
                        record.error = Some(format!("{:#}", e));
                        remaining_errors = true;
                    }
                }
                report(&*record);
            }
            if !(completed_any && remaining_errors) {
                break;
            }
        }

        let basic_empty = clusters
            .values()
            .any(|r| r.id == BASIC_CLUSTER && r.attrs.is_empty());
        if basic_empty {
            return Err(AfError::BasicClusterUnreadable.into());
        }
        Ok(clusters)
    }
}
