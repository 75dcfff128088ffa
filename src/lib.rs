pub mod shared {
    pub mod core {
        pub mod application_error;
    }
    pub mod infrastructure {
        pub mod change_outbox;
        pub mod listing_store;
        pub mod search_index;
    }
}

pub mod modules {
    pub mod access {
        pub mod core {
            pub mod access_guard;
            pub mod principal;
            pub mod token_verifier;
        }
        pub mod adapters {
            pub mod inbound {
                pub mod bearer;
            }
        }
    }
    pub mod listings {
        pub mod core {
            pub mod decide;
            pub mod listing;
        }
        pub mod use_cases {
            pub mod create_listing {
                pub mod command;
                pub mod handler;
                pub mod inbound {
                    pub mod http;
                }
            }
            pub mod update_listing {
                pub mod command;
                pub mod handler;
                pub mod inbound {
                    pub mod graphql;
                    pub mod http;
                }
            }
            pub mod delete_listing {
                pub mod command;
                pub mod handler;
                pub mod inbound {
                    pub mod http;
                }
            }
            pub mod get_listing {
                pub mod inbound {
                    pub mod http;
                }
            }
            pub mod search_listings {
                pub mod inbound {
                    pub mod graphql;
                    pub mod http;
                }
            }
        }
    }
    pub mod sync {
        pub mod core {
            pub mod drift;
            pub mod projection;
            pub mod retry_policy;
        }
        pub mod drift_sweep;
        pub mod reconciler;
        pub mod use_cases {
            pub mod failed_events {
                pub mod handler;
                pub mod inbound {
                    pub mod http;
                }
            }
        }
    }
}

pub mod shell;
