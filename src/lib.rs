/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Two-process bridge between VR applications and the HMD display server.
 *
 * A client application renders each frame's views into GPU textures in its
 * own process and hands them to a separate render-server process, which owns
 * the display pipeline and submits them to the headset. The processes share
 * a message-framed local pipe for control traffic (render parameters, buffer
 * registration, present requests) and rely on per-texture keyed mutexes as
 * the only data-plane synchronization for the shared texture contents.
 *
 * The [client] module is the application-facing surface; [session] contains
 * the server side. The `hmdpipe` binary runs the server (`serve`) or a
 * diagnostic client (`query`). */
pub mod client;
pub mod gate;
pub mod headless;
pub mod messages;
pub mod pipe;
pub mod pipeline;
pub mod session;
#[cfg(test)]
mod test;
pub mod texture;
pub mod util;
