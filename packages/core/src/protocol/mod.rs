// Протокол: тела HTTP API менеджера ключей и wire format конверта

pub mod messages;
pub mod wire;

pub use wire::{envelope_from_json, envelope_to_json, pack_envelope, unpack_envelope};
