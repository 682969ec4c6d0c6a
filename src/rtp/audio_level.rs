use webrtc::interceptor::Attributes;
use webrtc::rtp::{extension::audio_level_extension::AudioLevelExtension, header::Header};
use webrtc_util::marshal::Unmarshal;

/// Attribute key holding the RFC 6464 level (0 loudest, 127 silence).
pub const ATTR_AUDIO_LEVEL: usize = 0x6464_0001;
/// Attribute key holding the voice activity flag (1 or 0).
pub const ATTR_VOICE: usize = 0x6464_0002;

/// Reads the audio level extension with the negotiated `id` into `attributes`.
/// Returns the parsed value, or `None` when the packet does not carry it.
pub fn read_into(header: &Header, id: u8, attributes: &mut Attributes) -> Option<(u8, bool)> {
    let mut raw = header.get_extension(id)?;
    let ext = match AudioLevelExtension::unmarshal(&mut raw) {
        Ok(ext) => ext,
        Err(err) => {
            tracing::trace!("failed to parse audio level extension id={}: {}", id, err);
            return None;
        }
    };
    attributes.insert(ATTR_AUDIO_LEVEL, ext.level as usize);
    attributes.insert(ATTR_VOICE, ext.voice as usize);
    Some((ext.level, ext.voice))
}

/// Audio level previously stored by [`read_into`].
pub fn from_attributes(attributes: &Attributes) -> Option<(u8, bool)> {
    let level = *attributes.get(&ATTR_AUDIO_LEVEL)?;
    let voice = attributes.get(&ATTR_VOICE).copied().unwrap_or(0) != 0;
    Some((level as u8, voice))
}
