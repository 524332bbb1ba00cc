#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Import and optimization must reject bad input without panicking.
    let options = convfold_onnx::ImportOptions::default();
    if let Ok(mut model) = convfold_onnx::load_model(data, &options) {
        let _ = convfold_opt::optimize(&mut model.graph);
    }
});
