//! 流式翻译：把 Agent 执行的节点 / 事件转换为客户端协议事件

mod translator;

pub use translator::StreamTranslator;
