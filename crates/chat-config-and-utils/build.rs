fn main() {
    // Tell cargo to recompile when these compile-time env vars change.
    // Without this, option_env!() values get cached and won't update.
    println!("cargo:rerun-if-env-changed=SUPABASE_URL");
    println!("cargo:rerun-if-env-changed=SUPABASE_ANON_KEY");
    println!("cargo:rerun-if-env-changed=NGOBRAS_APP_URL");
}
