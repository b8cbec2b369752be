//! X11 key remapping engine.
//!
//! Grabs keys on the root window, asks a [`remap::RemapHandler`] what each
//! one should become for the focused window, and sends the result back to
//! that window as synthetic key events.

pub mod connection;
pub mod dispatch;
pub mod grab;
pub mod keys;
pub mod remap;
pub mod window;

#[cfg(test)]
mod testing;
