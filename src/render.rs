use crate::protocol::{Action, ActionBody, FileOpKind, LifecycleOp, ParsedMessage};

/// One-line label for an action.
pub fn describe_action(action: &Action) -> String {
    match &action.body {
        ActionBody::Reply { content } => content.clone(),
        ActionBody::Complete { .. } => "Result".to_string(),
        ActionBody::Question { question, .. } => format!("Question: {question}"),
        ActionBody::ShellCommand { command } => format!("Run command: {command}"),
        ActionBody::AsyncCommand { op, session, command } => match op {
            LifecycleOp::Start => format!(
                "Start async command: {session} ({})",
                command.as_deref().unwrap_or_default()
            ),
            LifecycleOp::Query => format!("Query async command: {session}"),
            LifecycleOp::Abort => format!("Abort async command: {session}"),
        },
        ActionBody::Subtask {
            op,
            session,
            sub_agent,
            task_desc,
            ..
        } => match op {
            LifecycleOp::Start => format!("Start subtask: {}", task_desc.as_deref().unwrap_or(session.as_str())),
            LifecycleOp::Query => format!("Query subtask: {}", sub_agent.as_deref().unwrap_or(session.as_str())),
            LifecycleOp::Abort => format!("Abort subtask: {}", sub_agent.as_deref().unwrap_or(session.as_str())),
        },
        ActionBody::FileOp { op, path, .. } => match op {
            FileOpKind::ListFiles => format!("List directory: {path}"),
            FileOpKind::GetContent => format!("Read file: {path}"),
            FileOpKind::PutContent | FileOpKind::ReplaceText => format!("Edit file: {path}"),
        },
        ActionBody::McpTool { tool, server, desc, .. } => {
            format!("Use MCP {server}/{tool}: {}", desc.as_deref().unwrap_or_default())
        }
        ActionBody::BuiltinTool { tool, desc, .. } => {
            format!("Builtin tool ({tool}): {}", desc.as_deref().unwrap_or_default())
        }
        ActionBody::Generic { content, .. } => format!("{}: {content}", action.kind),
    }
}

/// Plain-text rendering for the terminal. Hidden actions are skipped.
pub fn render_message(message: &ParsedMessage) -> String {
    let mut lines = Vec::new();
    if let Some(annotation) = &message.annotation {
        lines.push(format!("# {}", annotation.subject));
        if !annotation.context.is_empty() {
            lines.push(annotation.context.clone());
        }
    }
    if let Some(thinking) = &message.thinking {
        for line in thinking.lines() {
            lines.push(format!("> {line}"));
        }
    }
    for action in message.actions.iter().filter(|a| !a.hide) {
        match &action.body {
            ActionBody::Reply { content } => lines.push(content.clone()),
            ActionBody::Complete { content, .. } => {
                lines.push(format!("[{}]", describe_action(action)));
                lines.push(content.clone());
            }
            ActionBody::Question { options, .. } => {
                lines.push(format!("[{}]", describe_action(action)));
                for (i, option) in options.iter().enumerate() {
                    lines.push(format!("  {}. {option}", i + 1));
                }
            }
            _ => {
                let marker = if action.closed { "" } else { " ..." };
                lines.push(format!("[{}]{marker}", describe_action(action)));
            }
        }
    }
    for error in &message.errors {
        lines.push(format!("! {error}"));
    }
    lines.join("\n")
}
