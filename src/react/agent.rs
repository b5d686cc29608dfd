//! Agent 主循环
//!
//! PREPARE -> CALL_MODEL -> {DISPATCH_TOOLS -> PREPARE} | RESPOND。
//! 模型返回工具调用时：写入调用消息（content 置空）、并发执行工具、写入结果，再次调用模型；
//! 返回纯文本时：可选结构化解析，写入回复并结束，这是唯一的正常出口。
//! 卡死检测与最大步数只影响下一次是否提供工具，保证循环终止。

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::state::{Abandon, InvocationGuard};
use crate::core::{EngineError, RetryPolicy, StreamEvent, StreamingTask, Task, TaskArgs, Validator};
use crate::llm::{Completion, DeltaKind, LlmClient, ModelCall, ModelInput, ModelSettings};
use crate::memory::{ConversationMemory, Message};
use crate::observability::{noop_sink, SpanId, SpanOutcome, SpanStart, TraceSink};
use crate::react::events::send_event;
use crate::react::{AgentEvent, AgentResponse, Example, ExampleSelector, LoopGuard, PromptTemplate};
use crate::tools::{Tool, ToolDefinition, Toolkit};

/// 单次对话内最大工具往返次数，防止死循环
const DEFAULT_MAX_STEPS: usize = 20;

pub struct Agent {
    id: Uuid,
    memory: ConversationMemory,
    toolkit: Toolkit,
    prompt: PromptTemplate,
    guard: LoopGuard,
    max_steps: usize,
    structured: Option<Validator>,
    streaming: bool,
    model_task: Task,
    stream_task: StreamingTask,
    sink: Arc<dyn TraceSink>,
    pending: Option<PendingTurn>,
}

/// 进行中的一轮：开始时的记忆长度与 agent_turn span
struct PendingTurn {
    memory_len: usize,
    span: SpanId,
}

impl Agent {
    pub fn builder(client: Arc<dyn LlmClient>) -> AgentBuilder {
        AgentBuilder::new(client)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn toolkit(&self) -> &Toolkit {
        &self.toolkit
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// 清空对话历史
    pub fn reset(&mut self) {
        self.memory.clear();
        self.guard.reset();
    }

    pub async fn run(&mut self, input: impl Into<String>) -> Result<AgentResponse, EngineError> {
        self.run_with_events(input, None).await
    }

    /// 执行一轮对话；events 非空时推送增量文本、工具调用与最终结果
    ///
    /// 失败或被取消的一轮不会留下任何消息，记忆恢复到本轮开始之前。
    pub async fn run_with_events(
        &mut self,
        input: impl Into<String>,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> Result<AgentResponse, EngineError> {
        let input = input.into();
        let span = self.sink.begin_span(SpanStart {
            name: "agent_turn".to_string(),
            task_id: self.id,
            parent_id: None,
            input: Value::String(input.clone()),
        });

        self.pending = Some(PendingTurn {
            memory_len: self.memory.len(),
            span,
        });

        let result = {
            let mut guard = InvocationGuard::new(self);
            let result = guard.turn(input, events).await;
            guard.disarm();
            result
        };
        match &result {
            Ok(response) => {
                if let Some(turn) = self.pending.take() {
                    let output = serde_json::to_value(response).unwrap_or(Value::Null);
                    self.sink.end_span(&turn.span, SpanOutcome::Output(output));
                }
            }
            Err(err) => self.fail_turn(err),
        }
        result
    }

    fn fail_turn(&mut self, err: &EngineError) {
        if let Some(turn) = self.pending.take() {
            self.memory.truncate(turn.memory_len);
            self.sink.end_span(&turn.span, SpanOutcome::Error(err.to_string()));
        }
        tracing::warn!(agent = %self.id, error = %err, "agent turn failed");
    }

    async fn turn(
        &mut self,
        input: String,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> Result<AgentResponse, EngineError> {
        let turn_start = self.memory.len();
        let selected = self.prompt.select_examples(&input).await;
        self.memory.push(Message::user(input))?;
        self.guard.reset();

        let mut rounds = 0;
        loop {
            let offer_tools =
                !self.toolkit.is_empty() && !self.guard.is_stuck() && rounds < self.max_steps;
            let tools = if offer_tools {
                self.toolkit.schemas()
            } else {
                Vec::new()
            };
            let messages = self.prompt.build(&self.memory, turn_start, &selected);
            tracing::debug!(
                agent = %self.id,
                round = rounds,
                messages = messages.len(),
                offer_tools,
                "calling model"
            );
            let completion = self
                .call_model(ModelInput::new(messages, tools), events)
                .await?;

            if completion.has_tool_calls() && offer_tools {
                let calls = completion.tool_calls;
                send_event(events, AgentEvent::ToolCalls { calls: calls.clone() });
                self.memory.push(Message::assistant_tool_calls(calls.clone()))?;

                let outcomes = self.toolkit.dispatch(&calls).await?;
                for outcome in &outcomes {
                    self.memory.push(outcome.to_message())?;
                }
                rounds += 1;
                if self.guard.record(&outcomes) {
                    tracing::warn!(
                        agent = %self.id,
                        repeated = self.guard.threshold(),
                        "identical tool results, withholding tools"
                    );
                    send_event(
                        events,
                        AgentEvent::Stuck {
                            repeated: self.guard.threshold(),
                        },
                    );
                }
                send_event(events, AgentEvent::ToolResults { outcomes });
                continue;
            }

            if completion.has_tool_calls() {
                tracing::warn!(agent = %self.id, "model requested tools after they were withdrawn");
            }
            let content = completion.content_str().to_string();
            let structured = match &self.structured {
                Some(validator) => Some(parse_structured(&content, validator)?),
                None => None,
            };
            self.memory.push(Message::assistant(&content))?;

            let response = AgentResponse {
                content,
                structured,
                tool_rounds: rounds,
                forced: !offer_tools && !self.toolkit.is_empty(),
            };
            tracing::info!(
                agent = %self.id,
                tool_rounds = rounds,
                forced = response.forced,
                "agent turn complete"
            );
            send_event(
                events,
                AgentEvent::Final {
                    response: response.clone(),
                },
            );
            return Ok(response);
        }
    }

    async fn call_model(
        &mut self,
        input: ModelInput,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> Result<Completion, EngineError> {
        let args = input.into_args()?;
        if !self.streaming {
            return self.model_task.invoke(args).await?.into_typed();
        }

        let mut output: Option<TaskArgs> = None;
        {
            let mut stream = Box::pin(self.stream_task.stream(args)?);
            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Delta(delta) => {
                        if delta.kind == DeltaKind::AssistantText {
                            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                                send_event(events, AgentEvent::Delta { text });
                            }
                        }
                    }
                    StreamEvent::Completed(out) => output = Some(out),
                    StreamEvent::Error(message) => {
                        tracing::warn!(agent = %self.id, error = %message, "model stream failed");
                    }
                }
            }
        }
        match output {
            Some(out) => out.into_typed(),
            None => Err(self
                .stream_task
                .take_error()
                .unwrap_or_else(|| EngineError::execution("model stream ended without a result"))),
        }
    }
}

impl Abandon for Agent {
    fn abandon(&mut self) {
        self.fail_turn(&EngineError::Cancelled);
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("memory", &self.memory.len())
            .field("tools", &self.toolkit.names())
            .field("streaming", &self.streaming)
            .finish()
    }
}

/// 去掉 ```json 围栏后解析为 JSON 对象并校验
fn parse_structured(content: &str, validator: &Validator) -> Result<Value, EngineError> {
    let body = strip_code_fence(content);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| EngineError::StructuredOutput(format!("reply is not valid JSON: {e}")))?;
    let args = TaskArgs::from_value(value.clone())
        .map_err(|e| EngineError::StructuredOutput(e.to_string()))?;
    validator
        .validate(&args)
        .map_err(|e| EngineError::StructuredOutput(e.to_string()))?;
    Ok(value)
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Agent 构建器；LLM 客户端与 Sink 以句柄注入
pub struct AgentBuilder {
    client: Arc<dyn LlmClient>,
    settings: ModelSettings,
    retry: RetryPolicy,
    toolkit: Toolkit,
    tools: Vec<ToolDefinition>,
    prompt: PromptTemplate,
    stuck_threshold: usize,
    max_steps: usize,
    structured: Option<Validator>,
    streaming: bool,
    sink: Arc<dyn TraceSink>,
}

impl AgentBuilder {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        let defaults = AppConfig::default();
        Self {
            client,
            settings: ModelSettings::default(),
            retry: RetryPolicy::default(),
            toolkit: Toolkit::new(),
            tools: Vec::new(),
            prompt: PromptTemplate::new(
                defaults.agent.system_prompt,
                defaults.agent.memory_window,
            ),
            stuck_threshold: defaults.agent.stuck_threshold,
            max_steps: DEFAULT_MAX_STEPS,
            structured: None,
            streaming: false,
            sink: noop_sink(),
        }
    }

    /// 从配置读取模型参数、重试策略、提示与守卫阈值
    pub fn with_config(mut self, config: &AppConfig) -> Self {
        self.settings = ModelSettings::from(&config.llm);
        self.retry = RetryPolicy::from(&config.retry);
        self.toolkit = std::mem::take(&mut self.toolkit)
            .with_timeout(std::time::Duration::from_secs(config.tools.tool_timeout_secs));
        self.prompt.set_system_prompt(config.agent.system_prompt.clone());
        self.prompt.set_memory_window(config.agent.memory_window);
        self.stuck_threshold = config.agent.stuck_threshold;
        self.max_steps = config.agent.max_steps;
        self.streaming = config.agent.streaming;
        self
    }

    pub fn settings(mut self, settings: ModelSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt.set_system_prompt(prompt);
        self
    }

    pub fn memory_window(mut self, window: usize) -> Self {
        self.prompt.set_memory_window(window);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn toolkit(mut self, toolkit: Toolkit) -> Self {
        self.toolkit = toolkit;
        self
    }

    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(ToolDefinition::new(tool));
        self
    }

    pub fn example(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.prompt.add_example(Example::new(input, output));
        self
    }

    pub fn selector(mut self, selector: Arc<dyn ExampleSelector>) -> Self {
        self.prompt.set_selector(selector);
        self
    }

    /// 最终回复须是满足 validator 的 JSON 对象
    pub fn structured_output(mut self, validator: Validator) -> Self {
        self.structured = Some(validator);
        self
    }

    pub fn stuck_threshold(mut self, threshold: usize) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn streaming(mut self, enable: bool) -> Self {
        self.streaming = enable;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    /// 工具重名时失败
    pub fn build(self) -> Result<Agent, EngineError> {
        let mut toolkit = self.toolkit;
        for definition in self.tools {
            toolkit.register_definition(definition)?;
        }

        let id = Uuid::new_v4();
        toolkit.set_sink(self.sink.clone());
        toolkit.set_parent(id);
        let model_task = Task::builder(
            "model_call",
            ModelCall::new(self.client.clone(), self.settings.clone()),
        )
        .input_validator(ModelCall::input_validator())
        .output_validator(ModelCall::output_validator())
        .retry(self.retry.clone())
        .sink(self.sink.clone())
        .parent(id)
        .build();
        let stream_task = StreamingTask::new(
            "model_stream",
            ModelCall::new(self.client, self.settings),
        )
        .with_input_validator(ModelCall::input_validator())
        .with_output_validator(ModelCall::output_validator())
        .with_retry(self.retry)
        .with_sink(self.sink.clone())
        .with_parent(id);

        Ok(Agent {
            id,
            memory: ConversationMemory::new(),
            toolkit,
            prompt: self.prompt,
            guard: LoopGuard::new(self.stuck_threshold),
            max_steps: self.max_steps,
            structured: self.structured,
            streaming: self.streaming,
            model_task,
            stream_task,
            sink: self.sink,
            pending: None,
        })
    }
}
