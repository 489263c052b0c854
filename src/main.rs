fn main() {
    vr_frame_bridge_core::main();
}
