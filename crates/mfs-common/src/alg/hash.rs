mod crc;

pub use crc::{dvr_crc32, dvr_crc32_check, dvr_crc32_update, Crc32HasherIsoHdlc, RunningCrc32, CRC32_RESIDUAL};
