//! Text interchange formats
//!
//! Pure text ⇄ record converters shared by improvers and backends:
//! - **chapter_list** - `HH:MM:SS.mmm name` lines (mp4chaps compatible)
//! - **cue_sheet** - cue sheets with pre-gap handling
//! - **ffmetadata** - ffmpeg metadata dump / import map

pub mod chapter_list;
pub mod cue_sheet;
pub mod ffmetadata;
