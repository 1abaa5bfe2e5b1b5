//! Wire protocol constants shared by both ends of a link

/// Fixed value carried in the `checksum` field of every valid header.
///
/// This is a frame-sync marker, not a content digest.
pub const FRAME_SENTINEL: u32 = 0x1FE2_3DC4;

/// Encoded header size: `type:16 node_id:32 length:32 flag:8 checksum:32`
pub const HEADER_SIZE: usize = 15;

/// Message types must be strictly below this value
pub const TYPE_MAX: u16 = 0xFF;

/// Width of the username field in a link authentication request
pub const USERNAME_LEN: usize = 32;

/// Width of the password field in a link authentication request
pub const PASSWORD_LEN: usize = 16;

/// Class byte for link control traffic (auth, keepalive)
pub const FLAG_SYSTEM: u8 = 0;
