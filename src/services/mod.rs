pub mod comparison;
pub mod extraction;
pub mod feedback;
pub mod model_answer_index;
pub mod model_answers;
pub mod ocr;
pub mod scoring;
pub mod storage;
