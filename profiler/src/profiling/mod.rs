pub mod collapse;
pub mod harmonize;
pub mod label_merge;
