#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use capa_common::{constants, unix_micros};
pub use capa_producer::*;
pub use capa_wire::{compression, produce};
