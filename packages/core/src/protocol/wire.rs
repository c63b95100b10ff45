// Wire format конверта (MessagePack сериализация)
// Конверт передаётся внешним транспортом как непрозрачные байты

use rmp_serde::{Deserializer, Serializer};
use serde::{Deserialize, Serialize};

use crate::crypto::SecurityEnvelope;
use crate::error::{CryptoError, CryptoResult};

/// Упаковать конверт в MessagePack (поля как map, чтобы опциональные поля можно было опускать)
pub fn pack_envelope(envelope: &SecurityEnvelope) -> CryptoResult<Vec<u8>> {
    pack_raw(envelope)
}

/// Распаковать конверт и проверить его структуру
pub fn unpack_envelope(data: &[u8]) -> CryptoResult<SecurityEnvelope> {
    let envelope: SecurityEnvelope = unpack_raw(data)?;
    envelope.validate()?;
    Ok(envelope)
}

/// JSON-представление конверта (байтовые поля как массивы чисел)
pub fn envelope_to_json(envelope: &SecurityEnvelope) -> CryptoResult<String> {
    serde_json::to_string(envelope).map_err(|e| CryptoError::Serialization(format!("JSON encode error: {}", e)))
}

pub fn envelope_from_json(json: &str) -> CryptoResult<SecurityEnvelope> {
    let envelope: SecurityEnvelope =
        serde_json::from_str(json).map_err(|e| CryptoError::MalformedEnvelope(format!("JSON decode error: {}", e)))?;
    envelope.validate()?;
    Ok(envelope)
}

/// Упаковать произвольные данные в MessagePack
pub fn pack_raw<T: Serialize>(data: &T) -> CryptoResult<Vec<u8>> {
    let mut buffer = Vec::new();
    data.serialize(&mut Serializer::new(&mut buffer).with_struct_map())?;
    Ok(buffer)
}

/// Распаковать MessagePack в произвольный тип
pub fn unpack_raw<'a, T: Deserialize<'a>>(data: &'a [u8]) -> CryptoResult<T> {
    let mut deserializer = Deserializer::new(data);
    Ok(T::deserialize(&mut deserializer)?)
}
