pub mod assembler;
pub mod checkpoint;
pub mod script;
pub mod segmenter;
pub mod synthesis;
pub mod tts;
pub mod voices;
pub mod workflow;
