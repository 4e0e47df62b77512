pub mod wire_message;
