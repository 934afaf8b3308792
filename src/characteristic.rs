use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

bitflags! {
    /// Capability flags captured verbatim from service discovery.
    ///
    /// Advisory only: the session does not enforce them before issuing an
    /// operation, it surfaces whatever error the transport returns.
    #[derive(Serialize, Deserialize)]
    pub struct CharacteristicProps: u32 {
        const NONE = 0;

        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
    }
}

/// An addressable data slot within a service.
///
/// NB: a uuid is not a unique key for a characteristic; peripherals may
/// expose the same uuid multiple times under different services, so a
/// `CharacteristicInfo` always carries its parent service uuid too.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub props: CharacteristicProps,
}

impl CharacteristicInfo {
    pub fn is_writable_without_response(&self) -> bool {
        self.props.contains(CharacteristicProps::WRITE_WITHOUT_RESPONSE)
    }

    pub fn is_notifiable(&self) -> bool {
        self.props.contains(CharacteristicProps::NOTIFY)
    }
}
