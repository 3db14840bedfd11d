use std::time::Duration;

use rand::seq::IndexedRandom;

use crate::{
    sdam::description::{ClusterDescription, ServerDescription, ServerType, TopologyType},
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

impl ClusterDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {}. Topology: {}",
                criteria, self
            )
        } else {
            format!(
                "Server selection timeout: No available servers. Topology: {}",
                self
            )
        }
    }

    /// Picks one server at random among the suitable servers within the latency window, or
    /// `None` if no server is currently suitable.
    pub(crate) fn select_server<'a>(
        &'a self,
        criteria: &SelectionCriteria,
        local_threshold: Duration,
    ) -> Option<&'a ServerDescription> {
        let in_window = self.suitable_servers_in_latency_window(criteria, local_threshold);
        in_window.choose(&mut rand::rng()).copied()
    }

    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &SelectionCriteria,
        local_threshold: Duration,
    ) -> Vec<&'a ServerDescription> {
        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => self.suitable_servers(read_pref),
            SelectionCriteria::Predicate(ref filter) => self
                .servers
                .iter()
                .filter(|s| {
                    // If we're direct-connected or connected to a standalone, ignore whether the
                    // single server in the topology is data-bearing.
                    (self.topology_type == TopologyType::Single || s.server_type.is_data_bearing())
                        && filter(s)
                })
                .collect(),
        };

        retain_servers_within_latency_window(&mut suitable_servers, local_threshold);

        suitable_servers
    }

    fn suitable_servers(&self, read_preference: &ReadPreference) -> Vec<&ServerDescription> {
        match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single | TopologyType::LoadBalanced => self
                .servers
                .iter()
                .filter(|server| server.server_type.is_available())
                .collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference)
            }
        }
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Vec<&ServerDescription> {
        let tag_sets = read_preference.tag_sets();

        match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]).collect(),
            ReadPreference::Secondary { .. } => {
                self.suitable_servers_for_read_preference(&[ServerType::RsSecondary], tag_sets)
            }
            ReadPreference::PrimaryPreferred { .. } => {
                match self.servers_with_type(&[ServerType::RsPrimary]).next() {
                    Some(primary) => vec![primary],
                    None => self
                        .suitable_servers_for_read_preference(&[ServerType::RsSecondary], tag_sets),
                }
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let suitable_servers = self
                    .suitable_servers_for_read_preference(&[ServerType::RsSecondary], tag_sets);

                if suitable_servers.is_empty() {
                    self.servers_with_type(&[ServerType::RsPrimary]).collect()
                } else {
                    suitable_servers
                }
            }
            ReadPreference::Nearest { .. } => self.suitable_servers_for_read_preference(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                tag_sets,
            ),
        }
    }

    fn suitable_servers_for_read_preference(
        &self,
        types: &'static [ServerType],
        tag_sets: Option<&Vec<TagSet>>,
    ) -> Vec<&ServerDescription> {
        let mut servers = self.servers_with_type(types).collect();

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        servers
    }
}

fn retain_servers_within_latency_window(
    suitable_servers: &mut Vec<&ServerDescription>,
    local_threshold: Duration,
) {
    let shortest_average_rtt = suitable_servers
        .iter()
        .filter_map(|server_desc| server_desc.average_round_trip_time)
        .min();

    let max_rtt_within_window = match shortest_average_rtt {
        Some(rtt) => rtt.checked_add(local_threshold).unwrap_or(Duration::MAX),
        // No round trip times have been measured, so every suitable server is equally close.
        None => return,
    };

    suitable_servers.retain(move |server_desc| match server_desc.average_round_trip_time {
        Some(server_rtt) => server_rtt <= max_rtt_within_window,
        None => matches!(server_desc.server_type, ServerType::LoadBalancer),
    });
}

fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);

            return;
        }
    }

    servers.clear();
}
