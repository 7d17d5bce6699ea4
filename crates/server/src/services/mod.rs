pub mod cleanup;
pub mod mail;
pub mod membership;
pub mod quota;
pub mod slug;
pub mod visibility;
