mod control_plane;
mod suite;
mod tools;
