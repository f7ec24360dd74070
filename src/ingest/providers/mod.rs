pub mod echo_sso;
