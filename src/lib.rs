#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod compile;
mod error;
mod group;
mod keyed;
mod note;
mod signal;

pub use compile::{compile_notes, note_views, sort_notes, NoteLanguage, Workspace};
pub use error::SignalError;
pub use group::{group_files_by_tag, note_of_group, notes_of_files, NoteGroup};
pub use keyed::{diff_maps, MapDelta};
pub use note::{
    dir_of_path, is_index_meta, stem_of_path, tag_of_path, CompiledNote, ContentType, File,
    FileMap, Meta, Note, NoteId, NoteView, Rendered,
};
pub use signal::{Cell, Level, Ref, Signal, Try, Value};
