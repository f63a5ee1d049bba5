use crate::consensus::command::ClusterCommand;
use crate::consensus::members::Members;
use crate::consensus::NodeId;

/// Replicated configuration state. Membership itself lives in `Members`, which this mutates when
/// membership commands commit.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ClusterStateMachine {
    pub(crate) config_version: u64,
    pub(crate) config: Option<Vec<u8>>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Applied {
    Nothing,
    MemberAdded(NodeId),
    MemberRemoved { id: NodeId, address: String },
    ConfigUpdated,
}

impl ClusterStateMachine {
    pub(crate) fn restore(config_version: u64, config: Option<Vec<u8>>) -> Self {
        ClusterStateMachine { config_version, config }
    }

    pub(crate) fn apply(&mut self, command: ClusterCommand, members: &mut Members) -> Applied {
        match command {
            ClusterCommand::Noop => Applied::Nothing,
            ClusterCommand::AddMember { id, address } => {
                self.config_version += 1;
                if members.insert_if_absent(id.clone(), address) {
                    Applied::MemberAdded(id)
                } else {
                    Applied::Nothing
                }
            }
            ClusterCommand::RemoveMember { id } => {
                self.config_version += 1;
                match members.remove(&id) {
                    Some(removed) => Applied::MemberRemoved {
                        id,
                        address: removed.address,
                    },
                    None => Applied::Nothing,
                }
            }
            ClusterCommand::UpdateConfig { data } => {
                self.config_version += 1;
                self.config = Some(data);
                Applied::ConfigUpdated
            }
        }
    }
}
