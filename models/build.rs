fn main() {
    use build_script_cfg::Cfg;

    let recorder = Cfg::new("use_recorder");
    if cfg!(feature = "recorder") {
        recorder.define();
    }
}
