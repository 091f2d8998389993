//! Topology state for one replicated suffix, fed by Topology messages.

use std::collections::HashMap;

use dirsync_proto::msg::{DsInfo, RsInfo, TopologyMsg};

/// What this directory server currently knows about the topology.
#[derive(Debug, Clone, Default)]
pub struct TopologyView {
    rs_infos: HashMap<u16, RsInfo>,
    ds_infos: HashMap<u16, DsInfo>,
}

impl TopologyView {
    /// An empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the view with a received topology snapshot.
    pub fn update_from(&mut self, msg: &TopologyMsg) {
        self.rs_infos = msg.rs_infos.iter().map(|rs| (rs.server_id, rs.clone())).collect();
        self.ds_infos = msg.ds_infos.iter().map(|ds| (ds.replica_id, ds.clone())).collect();
    }

    /// A replication server by id.
    pub fn rs(&self, server_id: u16) -> Option<&RsInfo> {
        self.rs_infos.get(&server_id)
    }

    /// All known replication servers.
    pub fn rs_infos(&self) -> impl Iterator<Item = &RsInfo> {
        self.rs_infos.values()
    }

    /// All known directory servers.
    pub fn ds_infos(&self) -> impl Iterator<Item = &DsInfo> {
        self.ds_infos.values()
    }

    /// Ids of the directory servers connected to a replication server,
    /// sorted ascending.
    pub fn ds_connected_to(&self, rs_id: u16) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .ds_infos
            .values()
            .filter(|ds| ds.rs_id == rs_id)
            .map(|ds| ds.replica_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of replication servers known.
    pub fn rs_count(&self) -> usize {
        self.rs_infos.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> TopologyMsg {
        TopologyMsg {
            rs_infos: vec![
                RsInfo {
                    server_id: 201,
                    server_url: "rs1:8989".into(),
                    group_id: 1,
                    generation_id: 1,
                    weight: 1,
                    connected_ds_count: 2,
                },
                RsInfo {
                    server_id: 202,
                    server_url: "rs2:8989".into(),
                    group_id: 2,
                    generation_id: 1,
                    weight: 2,
                    connected_ds_count: 1,
                },
            ],
            ds_infos: vec![
                DsInfo { replica_id: 3, group_id: 1, rs_id: 201 },
                DsInfo { replica_id: 1, group_id: 1, rs_id: 201 },
                DsInfo { replica_id: 2, group_id: 2, rs_id: 202 },
            ],
        }
    }

    #[test]
    fn test_update_and_query() {
        let mut view = TopologyView::new();
        view.update_from(&topology());
        assert_eq!(view.rs_count(), 2);
        assert_eq!(view.rs(201).unwrap().weight, 1);
        assert_eq!(view.ds_connected_to(201), vec![1, 3]);
        assert_eq!(view.ds_connected_to(202), vec![2]);
        assert!(view.ds_connected_to(999).is_empty());
    }

    #[test]
    fn test_update_replaces_previous_view() {
        let mut view = TopologyView::new();
        view.update_from(&topology());
        view.update_from(&TopologyMsg::default());
        assert_eq!(view.rs_count(), 0);
        assert_eq!(view.ds_infos().count(), 0);
    }
}
