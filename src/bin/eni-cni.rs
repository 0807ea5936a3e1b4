use eni_cni::commands::run_cni;

fn main() {
    // Errors are reported to the runtime as a CNI error document on stdout.
    if let Err(failure) = run_cni() {
        let _ = failure.error_result().print();
        std::process::exit(1);
    }
}
