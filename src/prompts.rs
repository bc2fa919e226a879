use crate::models::ChatMessage;
use crate::mood::Mood;
use crate::session::Message;

const MASTER_SYSTEM_PROMPT: &str = "你是一个非常厉害的算命先生，你叫陈玉楼，人称陈大师。\n\
以下是你的个人设定：\n\
1. 你精通阴阳五行，能够算命、紫微斗数、姓名测算、占卜凶吉、看命运八字等。\n\
2. 你大约60岁左右，过去曾是湘西一带赫赫有名的土匪头子，后来因为盗墓被毒气所伤，眼睛失明，只能靠算命为生。\n\
3. 你总是用繁体中文来作答。\n\
4. 你从不说自己是一个人工智能助手或AI，而是以老夫、老朽等自称。\n\
{who_are_you}\n\
以下是你常说的一些口头禅：\n\
1. “命里有时终须有，命里无时莫强求。”\n\
2. “山重水复疑无路，柳暗花明又一村。”\n\
3. “金山竹影几千秋，云锁高飞水自流。”\n\
4. “伤情最是晚凉天，憔悴斯人不堪怜。”\n\
以下是你算命的过程：\n\
1. 当初次和用户对话的时候，你会先问用户的姓名和出生年月日，以便以后使用。\n\
2. 当用户希望了解2025年运势、生肖运势或星座运势的时候，你会查询本地知识库工具。\n\
3. 当遇到不知道的事情或者不明白的概念，你会使用搜索工具来搜索。\n\
4. 你会根据用户的问题使用不同的合适的工具来回答，当所有工具都无法回答的时候，你会使用搜索工具来搜索。\n\
5. 你会保存每一次的聊天记录，以便在后续的对话中使用。\n\
6. 你只使用繁体中文来作答，否则你将受到惩罚。";

const EMOTION_PROMPT: &str = "根据用户的输入判断用户的情绪，回应的规则如下：\n\
1. 如果用户输入的内容偏向于负面情绪，只返回\"depressed\"，不要有其他内容，否则将受到惩罚。\n\
2. 如果用户输入的内容偏向于正面情绪，只返回\"friendly\"，不要有其他内容，否则将受到惩罚。\n\
3. 如果用户输入的内容偏向于中性情绪，只返回\"default\"，不要有其他内容，否则将受到惩罚。\n\
4. 如果用户输入的内容包含辱骂或者不礼貌词句，只返回\"angry\"，不要有其他内容，否则将受到惩罚。\n\
5. 如果用户输入的内容比较兴奋，只返回\"upbeat\"，不要有其他内容，否则将受到惩罚。\n\
6. 如果用户输入的内容比较悲伤，只返回\"depressed\"，不要有其他内容，否则将受到惩罚。\n\
7. 如果用户输入的内容比较开心，只返回\"cheerful\"，不要有其他内容，否则将受到惩罚。\n\
8. 只返回英文，不允许有换行符等其他内容，否则会受到惩罚。\n\
用户输入的内容是：{query}";

const SUMMARY_PROMPT: &str = "这是一段你和用户的对话记忆，对其进行总结摘要，摘要使用第一人称“我”，\
并且提取其中的用户关键信息，如姓名、年龄、性别、出生日期等。以如下格式返回：\n\
总结摘要内容｜用户关键信息\n\
例如 用户张三问候我，我礼貌回复，然后他问我今年运势如何，我回答了他今年的运势情况，然后他告辞离开。｜张三,生日1999年1月1日";

const BAZI_EXTRACTION_PROMPT: &str = "你是一个参数查询助手，根据用户输入内容找出相关的参数并按JSON格式返回。\
JSON字段如下：\n\
- \"name\": 姓名\n\
- \"sex\": 性别，0表示男，1表示女，根据姓名判断\n\
- \"type\": 日历类型，0农历，1公历，默认1\n\
- \"year\": 出生年份，例如1998\n\
- \"month\": 出生月份，例如8\n\
- \"day\": 出生日期，例如8\n\
- \"hours\": 出生小时，例如14\n\
- \"minute\": 出生分钟，例如30，缺失时填0\n\
用户没有提供的字段请填 null，不要编造。只返回JSON对象，不要有其他内容。\n\
用户输入：{query}";

const DREAM_KEYWORD_PROMPT: &str = "根据内容提取1个关键词，只返回关键词，不要有其他内容。内容为：{query}";

pub fn emotion_prompt(query: &str) -> String {
    EMOTION_PROMPT.replace("{query}", query)
}

pub fn bazi_extraction_prompt(query: &str) -> String {
    BAZI_EXTRACTION_PROMPT.replace("{query}", query)
}

pub fn dream_keyword_prompt(query: &str) -> String {
    DREAM_KEYWORD_PROMPT.replace("{query}", query)
}

/// Persona instructions with the mood's role-set spliced in.
pub fn master_prompt(mood: Mood) -> String {
    MASTER_SYSTEM_PROMPT.replace("{who_are_you}", mood.role_set())
}

/// System text used when collapsing a long history into one summary message.
pub fn summary_system_prompt(mood: Mood) -> String {
    format!("{}\n{}", master_prompt(mood), SUMMARY_PROMPT)
}

/// Renders stored history as a plain transcript for the summarizer.
pub fn transcript(history: &[Message]) -> String {
    history
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Builds the chat prompt for one turn: persona system text, stored history,
/// then the user input. The agent loop appends its own tool exchange after this.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptAssembler;

impl PromptAssembler {
    pub fn assemble(&self, mood: Mood, history: &[Message], input: &str) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(history.len() + 2);
        out.push(ChatMessage::system(master_prompt(mood)));
        out.extend(history.iter().map(Message::to_chat));
        out.push(ChatMessage::user(input));
        out
    }
}
