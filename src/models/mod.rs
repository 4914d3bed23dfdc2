//! Defect records, their status encoding and inbound scan data.

pub mod ccn_defect;
pub mod defect_common;
pub mod defect_status;
pub mod observation;
